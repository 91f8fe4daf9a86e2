use std::collections::HashMap;
use std::io::IsTerminal;
use std::net::TcpListener;
use std::sync::Arc;

use clap::Parser;
use hyper::server::Server;
use s3s::auth::SimpleAuth;
use s3s::service::S3ServiceBuilder;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

use s3s_mpu_ingest::blob_store::{BlobStore, MemoryBlobStore};
use s3s_mpu_ingest::config::{MetadataBackend, Settings, StorageBackend};
use s3s_mpu_ingest::kms::LocalKms;
use s3s_mpu_ingest::meta_store::Bucket;
use s3s_mpu_ingest::metadata::{MemoryMetadata, MetadataService};
use s3s_mpu_ingest::part_store::{MemoryPartStore, PartStore};
use s3s_mpu_ingest::pg_database::PostgresDatabase;
use s3s_mpu_ingest::pipeline::PartIngestion;
use s3s_mpu_ingest::s3_client::S3Client;
use s3s_mpu_ingest::service::IngestGateway;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    #[arg(long, short, default_value = "config.yaml")]
    config: String,

    /// Opentelemetry endpoint (http://ip:port)
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    let config = Settings::new(&opt.config)?;

    setup_tracing(&opt).map_err(|e| e as Box<dyn std::error::Error>)?;
    let gateway = build_gateway(&config).await.map_err(|e| e as Box<dyn std::error::Error>)?;

    let service = {
        let mut b = S3ServiceBuilder::new(gateway);

        // Enable authentication
        b.set_auth(SimpleAuth::from_single(config.auth.access_key.clone(), config.auth.secret_key.clone()));
        info!("authentication is enabled");

        // Enable parsing virtual-hosted-style requests
        if let Some(domain_name) = &config.api.domain {
            b.set_base_domain(domain_name);
            info!("virtual-hosted-style requests are enabled");
        }

        b.build()
    };

    let listener = TcpListener::bind((config.api.host.as_str(), config.api.port))?;
    let local_addr = listener.local_addr()?;

    let server = Server::from_tcp(listener)?.serve(service.into_shared().into_make_service());

    info!("server is running at http://{local_addr}");
    server.with_graceful_shutdown(shutdown_signal()).await?;

    info!("server is stopped");
    Ok(())
}

async fn build_gateway(config: &Settings) -> Result<IngestGateway, BoxError> {
    let (metadata, parts): (Arc<dyn MetadataService>, Arc<dyn PartStore>) = match config.metadata.backend {
        MetadataBackend::Postgres => {
            let url = config.metadata.url.as_deref().ok_or("metadata.url is required for the postgres backend")?;
            let db = Arc::new(PostgresDatabase::new(url).await?);
            (db.clone() as Arc<dyn MetadataService>, db as Arc<dyn PartStore>)
        }
        MetadataBackend::Memory => {
            let metadata = MemoryMetadata::new();
            for seed in &config.buckets {
                metadata
                    .add_bucket(Bucket {
                        name: seed.name.clone(),
                        owner: seed.owner.clone(),
                        encryption: seed.encryption.clone(),
                    })
                    .await;
            }
            info!(buckets = config.buckets.len(), "using in-memory metadata");
            (
                Arc::new(metadata) as Arc<dyn MetadataService>,
                Arc::new(MemoryPartStore::new()) as Arc<dyn PartStore>,
            )
        }
    };

    let blobs: Arc<dyn BlobStore> = match config.storage.backend {
        StorageBackend::Upstream => {
            let upstream = config
                .storage
                .upstream
                .as_ref()
                .ok_or("storage.upstream is required for the upstream backend")?;
            Arc::new(S3Client::new(upstream))
        }
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };

    let kms = Arc::new(LocalKms::from_hex(&config.kms.master_keys)?);
    let ingestion = PartIngestion::new(metadata.clone(), kms, blobs, parts);

    let identities = HashMap::from([(config.auth.access_key.clone(), config.auth.canonical_id.clone())]);
    Ok(IngestGateway::new(metadata, ingestion, identities))
}

fn setup_tracing(args: &Opt) -> Result<(), BoxError> {
    let Some(endpoint) = args.otlp_endpoint.as_ref() else {
        use tracing_subscriber::EnvFilter;

        let env_filter = EnvFilter::from_default_env();
        let enable_color = std::io::stdout().is_terminal();

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().pretty().with_ansi(enable_color))
            .with(env_filter)
            .with(tracing_error::ErrorLayer::default())
            .try_init()?;
        return Ok(());
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(3)),
        )
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_resource(Resource::new(vec![KeyValue::new("service.name", "s3s_mpu_ingest")])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(true)
        .event_format(logfmt::MyFormatter);
    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::filter::LevelFilter::INFO)
        .with(fmt_layer)
        .with(tracing_error::ErrorLayer::default())
        .with(opentelemetry);
    registry.try_init()?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

mod logfmt {

    use std::fmt;
    use tracing_core::{Event, Subscriber};
    use tracing_subscriber::fmt::{
        format::{self, FormatEvent, FormatFields},
        FmtContext,
    };
    use tracing_subscriber::registry::LookupSpan;

    pub struct MyFormatter;

    impl<S, N> FormatEvent<S, N> for MyFormatter
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        N: for<'a> FormatFields<'a> + 'static,
    {
        fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: format::Writer<'_>, event: &Event<'_>) -> fmt::Result {
            let span = ctx.event_scope().and_then(|scope| scope.last());
            let metadata = event.metadata();
            write!(
                &mut writer,
                "[{}] {}: {:?} ",
                metadata.level(),
                metadata.target(),
                span.map_or("Id(None)".into(), |x| format!("{:?}", x.id())),
            )?;

            // Write fields on the event
            ctx.field_format().format_fields(writer.by_ref(), event)?;

            writeln!(writer)
        }
    }
}
