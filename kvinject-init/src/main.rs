//! `kvinject-init`: runs as an init container, logs in to Vault with the
//! pod's service account token, fetches the requested secrets and appends
//! them to an env file on a shared in-memory volume.

use std::{fs::OpenOptions, os::unix::fs::OpenOptionsExt};

use kvinject_common::{
    errors::exit_on_error,
    mapping::parse_directives,
    prelude::*,
    tracing_support::initialize_tracing,
    vault::VaultClient,
};
use structopt::StructOpt;

/// Command-line options, parsed using `structopt`.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "kvinject-init",
    about = "Fetch secrets from Vault and write them to a file."
)]
struct Opt {
    /// The file to append `NAME=VALUE` lines to.
    #[structopt(
        long = "path",
        default_value = "/var/run/secrets/vault/env",
        parse(from_os_str)
    )]
    output_path: PathBuf,

    /// Our Kubernetes service account token.
    #[structopt(
        long = "jwt",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token",
        parse(from_os_str)
    )]
    identity_token_path: PathBuf,

    /// The Vault role to log in as.
    #[structopt(long = "role")]
    role: String,

    /// The Vault server.
    #[structopt(long = "address", default_value = "http://127.0.0.1:8200")]
    address: String,

    /// A secret to fetch, as `NAME:PATH:KEY`. May be repeated.
    #[structopt(long = "secret", number_of_values = 1)]
    secrets: Vec<String>,
}

fn main() {
    initialize_tracing();
    openssl_probe::init_ssl_cert_env_vars();
    let opt = Opt::from_args();
    debug!("Args: {:?}", opt);
    exit_on_error(|| run(&opt));
}

/// Fetch everything, then write it. Nothing is written unless every step
/// before the write succeeds.
#[instrument(level = "debug", skip(opt))]
fn run(opt: &Opt) -> Result<()> {
    let mappings = parse_directives(&opt.secrets).context("error parsing --secret flags")?;

    let mut client = VaultClient::new();
    client.authenticate(&opt.identity_token_path, &opt.address, &opt.role)?;
    info!("authenticated to {} as role {:?}", opt.address, opt.role);

    let secrets = fetch_secrets(&client, &mappings)?;
    write_secrets(&opt.output_path, &secrets)?;
    info!(
        "wrote {} secrets to {}",
        secrets.len(),
        opt.output_path.display()
    );
    Ok(())
}

/// Fetch each mapping in order, stopping at the first failure. Later
/// mappings for the same name replace earlier ones.
fn fetch_secrets(
    client: &VaultClient,
    mappings: &[SecretMapping],
) -> Result<BTreeMap<String, String>> {
    let mut secrets = BTreeMap::new();
    for mapping in mappings {
        debug!("fetching {}", mapping.target_name());
        let value = client
            .fetch_secret(mapping.secret_path(), mapping.secret_key())
            .with_context(|| format!("could not fetch secret for {}", mapping.target_name()))?;
        secrets.insert(mapping.target_name().to_owned(), value);
    }
    Ok(secrets)
}

/// A secret which can't be written as a single `NAME=VALUE` line.
#[derive(Debug, thiserror::Error)]
#[error("the value of {name} contains a line break")]
struct MultilineValue {
    name: String,
}

/// Render secrets as `NAME=VALUE` lines.
fn to_env_lines(secrets: &BTreeMap<String, String>) -> Result<String, MultilineValue> {
    let mut out = String::new();
    for (name, value) in secrets {
        if value.contains(&['\n', '\r'][..]) {
            return Err(MultilineValue { name: name.clone() });
        }
        out.push_str(name);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

/// Append our secrets to `path` with a single write, creating it if needed.
/// Existing content is never truncated.
fn write_secrets(path: &Path, secrets: &BTreeMap<String, String>) -> Result<()> {
    let contents = to_env_lines(secrets)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvinject_common::{
        fake_vault::{FakeVault, FakeVaultConfig},
        vault::{FetchFailure, VaultError},
    };
    use std::fs;

    const ROLE: &str = "billing";
    const JWT: &str = "service-account-jwt";

    /// A scratch directory containing an identity token, and options which
    /// point at it and at `vault`.
    fn setup(vault: &FakeVault, secrets: &[&str]) -> (tempfile::TempDir, Opt) {
        let dir = tempfile::tempdir().unwrap();
        let identity_token_path = dir.path().join("token");
        fs::write(&identity_token_path, JWT).unwrap();
        let opt = Opt {
            output_path: dir.path().join("env"),
            identity_token_path,
            role: ROLE.to_owned(),
            address: vault.address(),
            secrets: secrets.iter().map(|s| (*s).to_owned()).collect(),
        };
        (dir, opt)
    }

    fn vault() -> FakeVault {
        FakeVault::start(
            FakeVaultConfig::new(ROLE, JWT)
                .with_secret("sql/billing", "password", "hunter2")
                .with_secret("sql/billing", "user", "billing")
                .with_secret("api/stripe", "key", "sk_test_123"),
        )
    }

    #[test]
    fn writes_all_secrets() {
        let vault = vault();
        let (_dir, opt) = setup(
            &vault,
            &["PGPASSWORD:sql/billing:password", "PGUSER:/sql/billing:user"],
        );
        run(&opt).expect("run failed");
        assert_eq!(
            fs::read_to_string(&opt.output_path).unwrap(),
            "PGPASSWORD=hunter2\nPGUSER=billing\n",
        );
    }

    #[test]
    fn appends_to_existing_file() {
        let vault = vault();
        let (_dir, opt) = setup(&vault, &["STRIPE_KEY:api/stripe:key"]);
        fs::write(&opt.output_path, "EXISTING=1\n").unwrap();
        run(&opt).expect("run failed");
        run(&opt).expect("second run failed");
        assert_eq!(
            fs::read_to_string(&opt.output_path).unwrap(),
            "EXISTING=1\nSTRIPE_KEY=sk_test_123\nSTRIPE_KEY=sk_test_123\n",
        );
    }

    #[test]
    fn one_failed_fetch_writes_nothing() {
        let vault = vault();
        let (_dir, opt) = setup(
            &vault,
            &[
                "PGPASSWORD:sql/billing:password",
                "PGHOST:sql/billing:host",
                "STRIPE_KEY:api/stripe:key",
            ],
        );
        let err = run(&opt).unwrap_err();
        let vault_err = err.downcast_ref::<VaultError>().expect("not a vault error");
        assert!(matches!(vault_err.fetch_failure(), Some(FetchFailure::KeyMissing)));
        assert!(!opt.output_path.exists());
        // We stopped at the failure.
        assert_eq!(vault.read_count(), 2);

        // A pre-existing file is left exactly as it was.
        fs::write(&opt.output_path, "EXISTING=1\n").unwrap();
        assert!(run(&opt).is_err());
        assert_eq!(fs::read_to_string(&opt.output_path).unwrap(), "EXISTING=1\n");
    }

    #[test]
    fn multiline_value_writes_nothing() {
        let vault = FakeVault::start(
            FakeVaultConfig::new(ROLE, JWT)
                .with_secret("sql/billing", "password", "hunter2")
                .with_secret("api/shady", "key", "x\nPATH=/evil"),
        );
        let (_dir, opt) = setup(
            &vault,
            &["PGPASSWORD:sql/billing:password", "A:api/shady:key"],
        );
        let err = run(&opt).unwrap_err();
        let multiline = err
            .downcast_ref::<MultilineValue>()
            .expect("not a multiline error");
        assert_eq!(multiline.name, "A");
        assert!(!opt.output_path.exists());
    }

    #[test]
    fn failed_login_writes_nothing() {
        let vault = vault();
        let (_dir, mut opt) = setup(&vault, &["PGPASSWORD:sql/billing:password"]);
        opt.role = "intruder".to_owned();
        let err = run(&opt).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VaultError>(),
            Some(VaultError::Auth { .. })
        ));
        assert!(!opt.output_path.exists());
        assert_eq!(vault.read_count(), 0);
    }

    #[test]
    fn malformed_directive_fails_before_login() {
        let vault = vault();
        let (_dir, opt) = setup(&vault, &["PGPASSWORD:sql/billing"]);
        assert!(run(&opt).is_err());
        assert_eq!(vault.login_count(), 0);
        assert!(!opt.output_path.exists());
    }

    #[test]
    fn duplicate_names_keep_last_value() {
        let vault = vault();
        let (_dir, opt) = setup(
            &vault,
            &["SECRET:sql/billing:password", "SECRET:api/stripe:key"],
        );
        run(&opt).expect("run failed");
        assert_eq!(
            fs::read_to_string(&opt.output_path).unwrap(),
            "SECRET=sk_test_123\n",
        );
    }

    #[test]
    fn parses_repeated_secret_flags() {
        let opt = Opt::from_iter(&[
            "kvinject-init",
            "--role=billing",
            "--secret=A:p:k",
            "--secret",
            "B:q:k",
            "--address=http://vault:8200",
        ]);
        assert_eq!(opt.secrets, &["A:p:k", "B:q:k"]);
        assert_eq!(opt.address, "http://vault:8200");
        assert_eq!(
            opt.output_path,
            Path::new("/var/run/secrets/vault/env")
        );
    }
}
