//! Error-reporting helpers.

use std::{error, fmt};

use anyhow::Error;

/// Support for displaying an error along with every error in its `source`
/// chain.
pub trait DisplayCausesExt {
    /// Display the error and its causes, one per line.
    fn display_causes(&self) -> DisplayCauses<'_>;
}

impl DisplayCausesExt for Error {
    fn display_causes(&self) -> DisplayCauses<'_> {
        let err: &(dyn error::Error + 'static) = self.as_ref();
        DisplayCauses::new(err)
    }
}

/// Helper type used to display errors.
pub struct DisplayCauses<'a> {
    /// The error to display.
    err: &'a (dyn error::Error + 'static),
}

impl<'a> DisplayCauses<'a> {
    /// Display any standard error along with its causes. Typed errors use
    /// this directly, since they don't go through `anyhow`.
    pub fn new(err: &'a (dyn error::Error + 'static)) -> Self {
        DisplayCauses { err }
    }
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.err)?;
        let mut source = self.err.source();
        while let Some(next) = source {
            writeln!(f, "  caused by: {}", next)?;
            source = next.source();
        }
        Ok(())
    }
}

/// Run `f`. If it fails, print the error and its causes to standard error and
/// exit with a non-zero status code.
pub fn exit_on_error<F>(f: F)
where
    F: FnOnce() -> crate::Result<()>,
{
    if let Err(err) = f() {
        eprint!("{}", err.display_causes());
        std::process::exit(1);
    }
}

#[test]
fn display_causes_walks_source_chain() {
    use anyhow::Context as _;

    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
    let err = Err::<(), _>(io)
        .context("could not read identity token")
        .unwrap_err();
    let shown = err.display_causes().to_string();
    assert_eq!(
        shown,
        "ERROR: could not read identity token\n  caused by: no such file\n",
    );
}
