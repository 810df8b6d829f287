use crate::{
    config::ConfigFile,
    file,
    grpc::{DeltaAdsServer, Generator, StreamMetricsFamily},
    source::{ConfigSource, Index, SharedIndex},
    tokens::TokenTable,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf};
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "xds-controller", about = "A delta xDS control plane for Envoy proxies")]
pub struct Args {
    #[clap(
        long,
        default_value = "xds_controller=info,warn",
        env = "XDS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:18000")]
    grpc_addr: SocketAddr,

    /// A JSON file describing the registered proxies.
    #[clap(long)]
    config: PathBuf,

    /// A JSON file of stream tokens. When unset, all streams are allowed.
    #[clap(long)]
    tokens: Option<PathBuf>,

    /// How often open streams re-check their token.
    #[clap(long, default_value = "300")]
    auth_check_frequency_secs: u64,

    /// How often the config and token files are checked for changes.
    #[clap(long, default_value = "1000")]
    config_refresh_ms: u64,

    /// Limits the number of concurrently open streams.
    #[clap(long)]
    max_streams: Option<usize>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            grpc_addr,
            config,
            tokens,
            auth_check_frequency_secs,
            config_refresh_ms,
            max_streams,
        } = self;

        log_format.try_init(log_level)?;

        let mut prom = <Registry>::default();
        let metrics = StreamMetricsFamily::register(prom.sub_registry_with_prefix("xds"));
        let admin = admin.into_builder().with_prometheus(prom).bind()?;
        let readiness = admin.readiness();
        let _admin = admin.spawn();

        let (drain_tx, drain_rx) = drain::channel();
        let refresh = Duration::from_millis(config_refresh_ms);

        // Load the initial state before serving so that a bad file fails fast.
        let index = Index::shared();
        let contents = tokio::fs::read(&config)
            .await
            .with_context(|| format!("failed to read {}", config.display()))?;
        index
            .write()
            .apply(ConfigFile::parse(&contents)?.into_snapshots()?);
        tokio::spawn(
            file::poll(
                config,
                refresh,
                contents,
                update_index(index.clone()),
                drain_rx.clone(),
            )
            .instrument(info_span!("config")),
        );

        let token_table = TokenTable::default();
        if let Some(path) = tokens {
            let contents = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            token_table.update(&contents)?;
            let table = token_table.clone();
            tokio::spawn(
                file::poll(
                    path,
                    refresh,
                    contents,
                    move |bytes| table.update(bytes),
                    drain_rx.clone(),
                )
                .instrument(info_span!("tokens")),
            );
        }

        let mut server = DeltaAdsServer::new(
            ConfigSource::new(index),
            Generator::default(),
            token_table,
            metrics,
            drain_rx.clone(),
        )
        .with_auth_check_frequency(Duration::from_secs(auth_check_frequency_secs));
        if let Some(max) = max_streams {
            server = server.with_max_streams(max);
        }
        let grpc = tokio::spawn(serve(grpc_addr, server, drain_rx));
        readiness.set(true);

        shutdown_signal().await?;
        info!("Received shutdown signal");
        readiness.set(false);
        drain_tx.drain().await;

        match grpc.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error),
            Err(_) => bail!("Aborted"),
        }
    }
}

fn update_index(index: SharedIndex) -> impl FnMut(&[u8]) -> Result<()> {
    move |bytes: &[u8]| {
        let snapshots = ConfigFile::parse(bytes)?.into_snapshots()?;
        index.write().apply(snapshots);
        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve(
    addr: SocketAddr,
    server: DeltaAdsServer<ConfigSource, Generator, TokenTable>,
    drain: drain::Watch,
) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(server.svc())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
