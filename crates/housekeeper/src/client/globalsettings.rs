use crate::client::output::outputs::Output;
use crate::common::config::EngineConfig;
use crate::engine::Engine;

pub struct GlobalSettings {
    config: EngineConfig,
    printer: Box<dyn Output>,
}

impl GlobalSettings {
    pub fn new(config: EngineConfig, printer: Box<dyn Output>) -> Self {
        GlobalSettings { config, printer }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn printer(&self) -> &dyn Output {
        self.printer.as_ref()
    }

    /// Opens the engine over the job journal of the configured working directory.
    pub fn engine(&self) -> crate::Result<Engine> {
        Engine::open(self.config.clone())
    }
}
