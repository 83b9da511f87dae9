use crate::{
    calibration::{CalibrationCache, FileCalibrationStore},
    config::{Config, ServerConfig},
    connections::ConnectionRegistry,
    distance::DistanceEstimator,
    handler::FrameHandler,
    inference::HttpInferenceClient,
    publisher::{ChannelRouter, GatewayClient},
    routes::api_routes,
    telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

pub type RelayHandler = FrameHandler<HttpInferenceClient, ChannelRouter>;

#[derive(Clone)]
pub struct SharedState {
    pub handler: Arc<RelayHandler>,
    pub registry: ConnectionRegistry,
    pub metrics: Arc<Metrics>,
    pub stage: String,
}

impl SharedState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let store = FileCalibrationStore::new(&config.calibration.table_path);
        let calibration = Arc::new(CalibrationCache::new(store, &config.calibration));
        let estimator = DistanceEstimator::new(config.calibration.focal_length);

        let inference = HttpInferenceClient::new(&config.inference)?;

        let registry = ConnectionRegistry::new();
        let gateway = GatewayClient::new(&config.gateway)?;
        let channel = ChannelRouter::new(registry.clone(), gateway);

        let handler = FrameHandler::new(
            calibration,
            inference,
            estimator,
            channel,
            metrics.clone(),
        );

        Ok(Self {
            handler: Arc::new(handler),
            registry,
            metrics,
            stage: config.gateway.stage.clone(),
        })
    }
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = Router::new()
            .merge(api_routes())
            .with_state(state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
