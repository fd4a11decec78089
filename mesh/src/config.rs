use std::{net::IpAddr, sync::Arc, time::Duration};

use derivative::Derivative;
use webrtc::{
    api::setting_engine::SettingEngine,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::configuration::RTCConfiguration,
};
use webrtc_ice::network_type::NetworkType;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:4000/socket";
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration for [`crate::room::RoomSession`].
#[derive(Clone, Debug)]
pub struct RoomConfig {
    /// WebSocket URL of the signaling relay.
    pub relay_url: String,
    /// Capacity of the [`crate::mesh::MeshEvent`] broadcast channel.
    pub event_capacity: usize,
    pub transport: WebRTCTransportConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            transport: Default::default(),
        }
    }
}

impl RoomConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }
}

/// Configuration for every peer connection created by [`crate::peer_connection::WebRTCConnectionFactory`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    pub announced_ips: Vec<IpAddr>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    pub network_types: Vec<NetworkType>,
    pub ice_username_fragment: Option<String>,
    pub ice_password: Option<String>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: vec![DEFAULT_STUN_SERVER.to_owned()],
                    ..Default::default()
                }],
                ..Default::default()
            },
            announced_ips: vec![],
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
            network_types: vec![],
            ice_username_fragment: None,
            ice_password: None,
        }
    }
}

impl WebRTCTransportConfig {
    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    /// Replaces the relay list handed to ICE. An empty list disables STUN/TURN.
    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.configuration.ice_servers = urls
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();
        self
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.announced_ips.is_empty() {
            let announced_ips = Arc::new(self.announced_ips.clone());
            setting_engine.set_ip_filter(Box::new({
                let announced_ips = Arc::clone(&announced_ips);
                move |ip| announced_ips.contains(&ip)
            }));
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        if self.ice_username_fragment.is_some() || self.ice_password.is_some() {
            let username = self.ice_username_fragment.clone().unwrap_or_default();
            let password = self.ice_password.clone().unwrap_or_default();
            setting_engine.set_ice_credentials(username, password);
        }

        setting_engine
    }
}
