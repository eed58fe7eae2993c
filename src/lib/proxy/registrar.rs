use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use super::types::{
    ProxyConfig, ProxyConfigApp, ProxyResult, ProxySettings, ROOT_INTERNAL_DOMAIN, Registrar,
    Route,
};

/// Keeps the route table in memory and rewrites the reverse proxy's config
/// file after every change. The proxy picks up the new file on its own.
pub struct FileRegistrar {
    settings: ProxySettings,
    routes: Mutex<BTreeMap<String, Route>>,
}

impl FileRegistrar {
    /// Publishes an empty configuration straight away so the proxy never
    /// reads routes left over from a previous run.
    pub fn new(settings: ProxySettings) -> ProxyResult<Self> {
        std::fs::create_dir_all(config_dir(&settings.config_path))?;

        let registrar = FileRegistrar {
            settings,
            routes: Mutex::new(BTreeMap::new()),
        };
        registrar.write_config(&registrar.routes.lock())?;

        Ok(registrar)
    }

    fn render(&self, routes: &BTreeMap<String, Route>) -> ProxyConfig {
        let apps = routes
            .values()
            .map(|route| {
                (
                    route.name.clone(),
                    ProxyConfigApp::new(route, &self.settings.upstream_host),
                )
            })
            .collect();

        ProxyConfig {
            listen_port: self.settings.listen_port,
            listen_port_tls: self.settings.listen_port_tls,
            apps,
        }
    }

    /// Write to a sibling temp file and rename it over the old config so the
    /// proxy only ever sees complete files.
    fn write_config(&self, routes: &BTreeMap<String, Route>) -> ProxyResult<()> {
        let buf = toml::to_string(&self.render(routes))?;

        let mut tmp = NamedTempFile::new_in(config_dir(&self.settings.config_path))?;
        tmp.write_all(buf.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.settings.config_path)
            .map_err(|err| err.error)?;

        debug!(
            path = %self.settings.config_path.display(),
            apps = routes.len(),
            "proxy config written"
        );
        Ok(())
    }
}

// The in-memory table only changes once the new file is in place.
impl Registrar for FileRegistrar {
    fn register_app(&self, id: &str, name: &str, domain: &str, port: u16) -> ProxyResult<()> {
        let mut routes = self.routes.lock();
        let mut next = routes.clone();
        next.insert(
            id.to_string(),
            Route {
                name: name.to_string(),
                domain: format!("{}{}", domain, ROOT_INTERNAL_DOMAIN),
                port,
            },
        );

        self.write_config(&next)?;
        *routes = next;
        Ok(())
    }

    fn delist_app(&self, id: &str) -> ProxyResult<()> {
        let mut routes = self.routes.lock();
        let mut next = routes.clone();
        next.remove(id);

        self.write_config(&next)?;
        *routes = next;
        Ok(())
    }

    fn routes(&self) -> BTreeMap<String, Route> {
        self.routes.lock().clone()
    }
}

fn config_dir(config_path: &Path) -> &Path {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}
