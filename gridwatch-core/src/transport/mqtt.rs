use super::{Inbound, Inbox, Transport};
use crate::error::TransportError;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
}

/// PEM files for mutual TLS with the broker.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsFiles {
    fn load(&self) -> Result<TlsConfiguration, TransportError> {
        let read = |path: &PathBuf| {
            std::fs::read(path).map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))
        };
        Ok(TlsConfiguration::Simple {
            ca: read(&self.ca)?,
            alpn: None,
            client_auth: Some((read(&self.cert)?, read(&self.key)?)),
        })
    }
}

/// Broker-backed transport. Subscriptions are remembered and replayed after
/// every reconnect, since sessions are clean.
pub struct MqttTransport {
    client: AsyncClient,
    filters: Shared<Vec<String>>,
}

impl MqttTransport {
    /// Builds the client and spawns its event loop. Must run inside a tokio runtime.
    pub fn connect(
        settings: &MqttSettings,
        tls: Option<&TlsFiles>,
    ) -> Result<(Arc<Self>, Inbox), TransportError> {
        let mut opts =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        opts.set_keep_alive(settings.keep_alive);
        if let Some(files) = tls {
            opts.set_transport(rumqttc::Transport::tls_with_config(files.load()?));
        }
        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let filters = new_state(Vec::<String>::new());
        let (sender, inbox) = mpsc::unbounded_channel();

        let replay = client.clone();
        let known = filters.clone();
        let host = settings.host.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(%host, "connected to broker");
                        for filter in known.lock().iter() {
                            if let Err(e) = replay.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                                warn!(%filter, error = %e, "re-subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let message =
                            Inbound { topic: p.topic.clone(), payload: p.payload.to_vec() };
                        if sender.send(message).is_err() {
                            debug!("inbox dropped, stopping mqtt event loop");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%host, error = %e, "mqtt connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok((Arc::new(Self { client, filters }), inbox))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut filters = self.filters.lock();
            if !filters.iter().any(|f| f == filter) {
                filters.push(filter.to_string());
            }
        }
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.filters.lock().retain(|f| f != filter);
        self.client.unsubscribe(filter).await?;
        Ok(())
    }
}
