use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use ldap_proxy::config::ConfigFile;

#[derive(Parser, Debug)]
#[command(name = "ldap-proxy", version)]
struct Args {
    /// Path to the proxy's YAML configuration document.
    #[arg(long, env = "LDAP_PROXY_CONFIG", default_value = "/etc/ldap-proxy/ldap-proxy.yaml")]
    config: PathBuf,
}

fn build_acceptor(cfg: &ldap_proxy::config::ProxyConfig) -> Option<SslAcceptor> {
    if !cfg.ssl {
        return None;
    }
    let chain = cfg.tls_chain.as_ref().expect("ssl=true requires tls_chain");
    let key = cfg.tls_key.as_ref().expect("ssl=true requires tls_key");

    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).expect("openssl init");
    builder
        .set_certificate_chain_file(chain)
        .expect("reading tls_chain");
    builder
        .set_private_key_file(key, SslFiletype::PEM)
        .expect("reading tls_key");
    Some(builder.build())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let initial = match ConfigFile::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let mut bind_failed = false;

    tracing_forest::worker_task()
        .set_tag(tracing_forest::tag::NoTag)
        .build()
        .on(async {
            tracing::debug!(directive = %initial.debug.to_filter_directive(), "starting");
            let acceptor = build_acceptor(&initial.config);
            if let Err(e) = ldap_proxy::proxy::run(&args.config, acceptor).await {
                tracing::error!(error = %e, "fatal startup error");
                bind_failed = true;
            }
        })
        .await;

    if bind_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
