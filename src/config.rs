use serde::Deserialize;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_connection_limit: Option<usize>,
    /// STUN/TURN urls handed to every new peer connection.
    pub ice_servers: Option<Vec<String>>,
}

impl Config {
    pub fn ice_servers(&self) -> Vec<String> {
        match &self.ice_servers {
            Some(urls) if !urls.is_empty() => urls.clone(),
            _ => vec![DEFAULT_ICE_SERVER.to_owned()],
        }
    }
}
