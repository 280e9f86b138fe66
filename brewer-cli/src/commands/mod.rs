//! One module per subcommand; `App` wires the shared state.

pub mod build;
pub mod cat;
pub mod children;
pub mod fetch;
pub mod list;
pub mod parents;
pub mod push;
pub mod put_shared;
pub mod remote_arches;

use anyhow::Result;
use brewer_core::cache::MetadataResolver;
use brewer_core::engine::Engine;
use brewer_core::gitstore::GitStore;
use brewer_core::manifest::Library;
use brewer_core::plan::Planner;
use brewer_core::registry::RegistryClient;
use brewer_core::store::EmbeddedStore;
use brewer_core::Config;

pub struct App {
    pub config: Config,
    pub library: Library,
    pub gitstore: GitStore,
    pub engine: Engine,
}

impl App {
    pub fn new(config: Config) -> App {
        let library = Library::new(&config.library);
        let gitstore = GitStore::new(&config.cache);
        App {
            config,
            library,
            gitstore,
            engine: Engine::new(),
        }
    }

    pub fn resolver(&self) -> MetadataResolver<'_> {
        MetadataResolver::new(&self.config, &self.gitstore, &self.engine)
    }

    /// Commands that touch built artifacts also need the content store.
    pub fn open_store(&self) -> Result<EmbeddedStore> {
        if let Ok(address) = std::env::var("BASHBREW_CONTAINERD_ADDRESS") {
            if !address.is_empty() {
                anyhow::bail!(
                    "external containerd content stores (BASHBREW_CONTAINERD_ADDRESS={:?}) are not supported by this build; unset it to use the embedded store",
                    address
                );
            }
        }
        Ok(EmbeddedStore::open(&self.config.content_store_root())?)
    }

    pub fn planner<'a>(
        &'a self,
        resolver: &'a MetadataResolver<'a>,
        store: &'a EmbeddedStore,
    ) -> Planner<'a> {
        Planner {
            config: &self.config,
            library: &self.library,
            gitstore: &self.gitstore,
            engine: &self.engine,
            store,
            resolver,
            registry: RegistryClient::new(),
        }
    }
}
