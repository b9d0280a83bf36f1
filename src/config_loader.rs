use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub scene_path: String,
    pub output_path: String,
    pub render_width: u32,
    pub render_height: u32,
    pub shader_search_paths: Vec<PathBuf>,
    pub program: String,
    pub prefer_fast_trace: bool,
    pub allow_compaction: bool,
    pub sample_batch: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scene_path: "assets/scene.glb".to_string(),
            output_path: "out.hdr".to_string(),
            render_width: 800,
            render_height: 600,
            shader_search_paths: vec![PathBuf::from("shaders"), PathBuf::from("../shaders")],
            program: "raytrace.comp.spv".to_string(),
            prefer_fast_trace: true,
            allow_compaction: false,
            sample_batch: 0,
        }
    }
}

impl Config {
    pub fn from_str(value: &str) -> serde_json::Result<Self> {
        serde_json::from_str(value)
    }
}

/// Reads the config file, writing the defaults back on first run.
pub struct ConfigFileLoader {
    pub path: PathBuf,
    config: Option<Config>,
}

impl ConfigFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: None,
        }
    }

    pub fn load_config(&mut self) -> anyhow::Result<&mut Config> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(content) => Config::from_str(&content)?,
            Err(_) => {
                let config = Config::default();
                self.config = Some(config.clone());
                self.save_config()?;
                config
            }
        };
        self.config = Some(config);
        Ok(self.config.as_mut().unwrap())
    }

    pub fn save_config(&self) -> anyhow::Result<()> {
        if let Some(config) = &self.config {
            let content = serde_json::to_string_pretty(config)?;
            std::fs::write(&self.path, content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_str(&json).unwrap();
        assert_eq!(parsed.render_width, config.render_width);
        assert_eq!(parsed.render_height, config.render_height);
        assert_eq!(parsed.program, config.program);
        assert_eq!(parsed.prefer_fast_trace, config.prefer_fast_trace);
    }

    #[test]
    fn partial_configs_are_rejected() {
        assert!(Config::from_str("{\"scene_path\": \"x.glb\"}").is_err());
    }
}
