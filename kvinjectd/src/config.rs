//! Command-line and environment configuration for `kvinjectd`.

use std::{net::SocketAddr, path::PathBuf};

use structopt::StructOpt;

/// Command-line options, parsed using `structopt`. Options which take a value
/// can also be set through an environment variable, which is how our
/// deployment manifest configures us.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "kvinjectd",
    about = "A mutating admission webhook which injects Vault secrets into pods."
)]
pub struct Opt {
    /// The port to serve the webhook on.
    #[structopt(long = "port", env = "KVINJECT_PORT", default_value = "8080")]
    pub port: u16,

    /// The port to serve `/metrics` on, over plain HTTP.
    #[structopt(
        long = "metrics-port",
        env = "KVINJECT_METRICS_PORT",
        default_value = "8888"
    )]
    pub metrics_port: u16,

    /// Serve plain HTTP instead of HTTPS.
    #[structopt(long = "disable-tls")]
    pub disable_tls: bool,

    /// The PEM-encoded TLS certificate chain.
    #[structopt(
        long = "cert-path",
        env = "KVINJECT_CERT_PATH",
        default_value = "/etc/webhook/certs/cert.pem",
        parse(from_os_str)
    )]
    pub cert_path: PathBuf,

    /// The PEM-encoded TLS private key.
    #[structopt(
        long = "key-path",
        env = "KVINJECT_KEY_PATH",
        default_value = "/etc/webhook/certs/key.pem",
        parse(from_os_str)
    )]
    pub key_path: PathBuf,

    /// How to build the containers we inject.
    #[structopt(flatten)]
    pub injector: InjectorConfig,
}

impl Opt {
    /// The address to listen on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// The address to serve metrics on.
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }
}

/// Settings for the init container we add to each mutated pod. This is
/// read once at startup and shared read-only between requests.
#[derive(Clone, Debug, StructOpt)]
pub struct InjectorConfig {
    /// The image containing `kvinject-init`.
    #[structopt(
        long = "init-image",
        env = "KVINJECT_INIT_IMAGE",
        default_value = "kvinject/kvinject-init:latest"
    )]
    pub init_image: String,

    /// The pull policy for the init image.
    #[structopt(
        long = "image-pull-policy",
        env = "KVINJECT_IMAGE_PULL_POLICY",
        default_value = "Always"
    )]
    pub image_pull_policy: String,

    /// CPU request for the init container.
    #[structopt(long = "cpu-request", env = "KVINJECT_CPU_REQUEST", default_value = "100m")]
    pub cpu_request: String,

    /// CPU limit for the init container.
    #[structopt(long = "cpu-limit", env = "KVINJECT_CPU_LIMIT", default_value = "200m")]
    pub cpu_limit: String,

    /// Memory request for the init container.
    #[structopt(
        long = "memory-request",
        env = "KVINJECT_MEMORY_REQUEST",
        default_value = "64Mi"
    )]
    pub memory_request: String,

    /// Memory limit for the init container.
    #[structopt(
        long = "memory-limit",
        env = "KVINJECT_MEMORY_LIMIT",
        default_value = "128Mi"
    )]
    pub memory_limit: String,

    /// The Vault address used unless a pod overrides it with an annotation.
    #[structopt(
        long = "default-address",
        env = "KVINJECT_DEFAULT_ADDRESS",
        default_value = "http://vault:8200"
    )]
    pub default_address: String,
}

#[cfg(test)]
impl InjectorConfig {
    /// A fixed configuration for tests, independent of the environment.
    pub fn for_tests() -> Self {
        InjectorConfig {
            init_image: "kvinject/kvinject-init:test".to_owned(),
            image_pull_policy: "IfNotPresent".to_owned(),
            cpu_request: "100m".to_owned(),
            cpu_limit: "200m".to_owned(),
            memory_request: "64Mi".to_owned(),
            memory_limit: "128Mi".to_owned(),
            default_address: "http://vault:8200".to_owned(),
        }
    }
}

#[test]
fn parses_flags() {
    let opt = Opt::from_iter(&[
        "kvinjectd",
        "--port=8443",
        "--metrics-port=9090",
        "--disable-tls",
        "--init-image=registry.local/kvinject-init:1.2",
        "--default-address=https://vault.internal:8200",
        "--memory-limit=256Mi",
    ]);
    assert_eq!(opt.port, 8443);
    assert!(opt.disable_tls);
    assert_eq!(opt.listen_addr().port(), 8443);
    assert_eq!(opt.metrics_addr().port(), 9090);
    assert_eq!(opt.injector.init_image, "registry.local/kvinject-init:1.2");
    assert_eq!(opt.injector.default_address, "https://vault.internal:8200");
    assert_eq!(opt.injector.memory_limit, "256Mi");
}
