use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ProbeConfig {
    pub rpcs: Option<Vec<String>>,
    pub methods: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub exponential_backoff: Option<bool>,
    pub concurrency: Option<usize>,
    pub include_errors: Option<bool>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub probe: Option<ProbeConfig>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("rpcprobe.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}
