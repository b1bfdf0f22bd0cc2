use opentelemetry::KeyValue;
use std::sync::Arc;
use structopt::StructOpt;

use common_lib::{lock::ClusterLockRegistry, tracing_telemetry};
use k8s_operator::{
    cluster::{
        api::KubeClusterApi,
        dispatch::{self, OperatorContext},
        retry::RetryPolicy,
    },
    config::{self, OperatorConfig},
    shell::MysqlShell,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "operator-innodbcluster")]
struct CliArgs {
    /// The namespace to operate in
    #[structopt(long, short, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// The period at which healthy clusters are re-probed
    #[structopt(long, default_value = "30s")]
    probe_interval: humantime::Duration,

    /// The timeout for each member probe connection
    #[structopt(long, default_value = "5s")]
    probe_timeout: humantime::Duration,

    /// The maximum number of concurrent member probes per cluster
    #[structopt(long, default_value = "8")]
    probe_fanout: usize,

    /// The number of in-place retries before an admin failure escalates
    #[structopt(long, default_value = "3")]
    retries: u32,

    /// The pause between in-place retries
    #[structopt(long, default_value = "2s")]
    retry_delay: humantime::Duration,

    /// Path of the mysqlsh binary used for admin operations
    #[structopt(long, env = "MYSQLSH", default_value = "mysqlsh")]
    mysqlsh: String,

    /// Add process service tags to the traces
    #[structopt(short, long, env = "TRACING_TAGS", value_delimiter = ",", parse(try_from_str = tracing_telemetry::parse_key_value))]
    tracing_tags: Vec<KeyValue>,

    /// Trace requests to the Jaeger endpoint agent
    #[structopt(long, short)]
    jaeger: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::from_args();

    if config::debug_level() > 0 && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    let mut tags = tracing_telemetry::default_tracing_tags(env!("CARGO_PKG_VERSION"));
    tags.extend(cli_args.tracing_tags.clone());
    tracing_telemetry::init_tracing("operator-innodbcluster", tags, cli_args.jaeger.clone());

    config::log_config_banner();
    tracing::info!(options = ?cli_args, "starting InnoDBCluster operator");

    let client = kube::Client::try_default().await?;
    dispatch::ensure_crd(client.clone())
        .await
        .map_err(|error| anyhow::anyhow!("installing the InnoDBCluster CRD failed: {}", error))?;

    let operator_config = OperatorConfig {
        probe_timeout: cli_args.probe_timeout.into(),
        probe_fanout: cli_args.probe_fanout,
        retry: RetryPolicy {
            max_attempts: cli_args.retries.max(1),
            delay: cli_args.retry_delay.into(),
        },
        admin_user: config::CLUSTER_ADMIN_USER_NAME.to_string(),
    };

    let context = OperatorContext {
        client: client.clone(),
        api: Arc::new(KubeClusterApi::new(client, &operator_config.admin_user)),
        admin: Arc::new(MysqlShell::new(&cli_args.mysqlsh)),
        locks: ClusterLockRegistry::new(),
        config: operator_config,
        namespace: cli_args.namespace.clone(),
        probe_interval: cli_args.probe_interval.into(),
    };

    dispatch::run(context).await;
    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}
