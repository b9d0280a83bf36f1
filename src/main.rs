mod config_loader;
mod error;
mod loader;
mod output;
mod renderer;
mod shader_interface;
mod vulkan;

use env_logger::Env;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "raybake.json".to_string());
    let mut config_loader = config_loader::ConfigFileLoader::new(config_path);
    let config = config_loader.load_config()?.clone();

    renderer::bake(&config)
}
