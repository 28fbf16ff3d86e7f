// src/nat/gateway.rs
//! Gateway port-mapping probes used as an extra server reflexive source
//!
//! Gathering asks a [`GatewayProber`] to map each host candidate's port on
//! the local gateway. A mapping becomes a server reflexive candidate with
//! the gateway's external address. Probing is off unless a prober is
//! supplied to the agent.

use std::net::SocketAddr;

use futures::future::BoxFuture;

use crate::nat::error::IceResult;

/// Something that can open an external mapping for a local UDP port
pub trait GatewayProber: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Map `local` and return the external address, `None` when not applicable
    fn probe(&self, local: SocketAddr) -> BoxFuture<'_, IceResult<Option<SocketAddr>>>;
}

#[cfg(feature = "upnp")]
pub use self::upnp::UpnpGatewayProber;

#[cfg(feature = "upnp")]
mod upnp {
    use std::net::{IpAddr, SocketAddr};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use igd::aio::search_gateway;
    use igd::{PortMappingProtocol, SearchOptions};
    use tracing::{debug, info};

    use super::GatewayProber;
    use crate::nat::error::{IceError, IceResult};

    /// UPnP IGD prober
    #[derive(Debug, Clone)]
    pub struct UpnpGatewayProber {
        /// Discovery timeout
        pub search_timeout: Duration,
        /// Mapping lease in seconds, 0 for the gateway's maximum
        pub lease_duration: u32,
        /// Mapping description shown by the gateway
        pub description: String,
    }

    impl Default for UpnpGatewayProber {
        fn default() -> Self {
            Self {
                search_timeout: Duration::from_secs(3),
                lease_duration: 3600,
                description: "sharp-ice".to_string(),
            }
        }
    }

    impl GatewayProber for UpnpGatewayProber {
        fn name(&self) -> &str {
            "upnp"
        }

        fn probe(&self, local: SocketAddr) -> BoxFuture<'_, IceResult<Option<SocketAddr>>> {
            Box::pin(async move {
                // IGD mappings are IPv4 only
                let SocketAddr::V4(local_v4) = local else {
                    return Ok(None);
                };

                let options = SearchOptions {
                    timeout: Some(self.search_timeout),
                    ..Default::default()
                };
                let gateway = search_gateway(options)
                    .await
                    .map_err(|e| IceError::Gateway(format!("gateway search failed: {}", e)))?;
                debug!("UPnP gateway found: {}", gateway.addr);

                let external_ip = gateway
                    .get_external_ip()
                    .await
                    .map_err(|e| IceError::Gateway(format!("external IP query failed: {}", e)))?;

                gateway
                    .add_port(
                        PortMappingProtocol::UDP,
                        local_v4.port(),
                        local_v4,
                        self.lease_duration,
                        &self.description,
                    )
                    .await
                    .map_err(|e| IceError::Gateway(format!("port mapping failed: {}", e)))?;

                let external = SocketAddr::new(IpAddr::V4(external_ip), local_v4.port());
                info!("UPnP mapped {} -> {}", local, external);
                Ok(Some(external))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProber(SocketAddr);

    impl GatewayProber for FixedProber {
        fn name(&self) -> &str {
            "fixed"
        }

        fn probe(&self, local: SocketAddr) -> BoxFuture<'_, IceResult<Option<SocketAddr>>> {
            Box::pin(async move { Ok(Some(SocketAddr::new(self.0.ip(), local.port()))) })
        }
    }

    #[tokio::test]
    async fn test_prober_object_safety() {
        let prober: Box<dyn GatewayProber> = Box::new(FixedProber("203.0.113.1:0".parse().unwrap()));
        let mapped = prober.probe("10.0.0.1:4000".parse().unwrap()).await.unwrap();
        assert_eq!(mapped, Some("203.0.113.1:4000".parse().unwrap()));
        assert_eq!(prober.name(), "fixed");
    }
}
