use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{
    Credentials, PartitionConfig, ServerConfig, DEFAULT_HOST, DEFAULT_SCHEMAS,
};
use crate::engine;
use crate::error::{Error, Result};
use crate::import::AdminSession;
use crate::port::{self, PortReservation, DEFAULT_PORT_START, PORT_CEILING};
use crate::workspace::Workspace;
use crate::FixtureHandle;

#[derive(Debug)]
enum LdifSource {
    File(PathBuf),
    Text(String),
}

/// Fixture builder
///
/// Starts from the `o=test` partition, the `uid=admin,ou=system` / `secret`
/// administrator and a free port searched upward from 1024.
#[derive(Debug)]
pub struct FixtureBuilder {
    data_dir: Option<PathBuf>,
    host: String,
    port: Option<u16>,
    port_range: (u16, u16),
    credentials: Credentials,
    partitions: Vec<PartitionConfig>,
    schemas: Vec<PathBuf>,
    imports: Vec<LdifSource>,
    shutdown_hook: bool,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        FixtureBuilder::new()
    }
}

impl FixtureBuilder {
    /// Builder with the `o=test` partition
    pub fn new() -> Self {
        FixtureBuilder {
            data_dir: None,
            host: DEFAULT_HOST.to_string(),
            port: None,
            port_range: (DEFAULT_PORT_START, PORT_CEILING),
            credentials: Credentials::default(),
            partitions: vec![PartitionConfig::test()],
            schemas: DEFAULT_SCHEMAS.iter().map(PathBuf::from).collect(),
            imports: vec![],
            shutdown_hook: true,
        }
    }

    /// Use `dir` as data directory; it is wiped before use
    ///
    /// Without it the fixture lives in a temporary directory removed on drop.
    pub fn data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Listen host, also used in the URL
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Listen on this port instead of searching one
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Search a free port in `start..=end`
    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = (start, end);
        self
    }

    /// Administrator bind DN and password
    pub fn credentials(mut self, principal: &str, secret: &str) -> Self {
        self.credentials = Credentials::new(principal, secret);
        self
    }

    /// Serve another partition next to `o=test`
    pub fn partition(mut self, partition: PartitionConfig) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Replace every partition, `o=test` included
    pub fn partitions(mut self, partitions: Vec<PartitionConfig>) -> Self {
        self.partitions = partitions;
        self
    }

    /// Add an equality index to every partition
    pub fn index(mut self, attribute: &str) -> Self {
        self.partitions = self
            .partitions
            .into_iter()
            .map(|p| p.index(attribute))
            .collect();
        self
    }

    /// Load a schema LDIF, relative paths are looked up in the slapd schema directory
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ldapd_fixture::FixtureBuilder;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let fixture = FixtureBuilder::new()
    ///     .schema("collective.ldif")
    ///     .run()
    ///     .await
    ///     .unwrap();
    /// # }
    /// ```
    pub fn schema<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.schemas.push(file.as_ref().to_path_buf());
        self
    }

    /// Import LDIF text once the server runs
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ldapd_fixture::FixtureBuilder;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let fixture = FixtureBuilder::new()
    ///     .add("dn: ou=people,o=test
    /// objectClass: organizationalUnit
    /// ou: people")
    ///     .run()
    ///     .await
    ///     .unwrap();
    /// # }
    /// ```
    pub fn add(mut self, ldif: &str) -> Self {
        self.imports.push(LdifSource::Text(ldif.to_string()));
        self
    }

    /// Import an LDIF file once the server runs
    pub fn add_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.imports
            .push(LdifSource::File(file.as_ref().to_path_buf()));
        self
    }

    /// Kill slapd when the handle is dropped (default `true`)
    pub fn shutdown_hook(mut self, enabled: bool) -> Self {
        self.shutdown_hook = enabled;
        self
    }

    fn reserve_port(&self) -> Result<PortReservation> {
        match self.port {
            Some(port) => PortReservation::claim(port).ok_or_else(|| {
                Error::engine(format!("port {port} is used by another fixture"))
            }),
            None => port::find_available(self.port_range.0, self.port_range.1),
        }
    }

    /// Clean the workspace, start slapd and import the LDIF sources in order
    ///
    /// On failure slapd is stopped; records imported before a failing one
    /// are not rolled back, the data directory keeps them.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ldapd_fixture::{FixtureBuilder, FixtureHandle};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let fixture: FixtureHandle = FixtureBuilder::new()
    ///     .data_dir("target/ldapd")
    ///     .run()
    ///     .await
    ///     .unwrap();
    /// assert_eq!(fixture.base_dn(), "o=test");
    /// # }
    /// ```
    pub async fn run(self) -> Result<FixtureHandle> {
        let workspace = match &self.data_dir {
            Some(dir) => Workspace::clean(dir).await?,
            None => Workspace::temporary()?,
        };
        let reservation = self.reserve_port()?;

        let config = ServerConfig {
            working_directory: workspace.path().to_path_buf(),
            network_enabled: true,
            host: self.host,
            listen_port: reservation.port(),
            shutdown_hook_enabled: self.shutdown_hook,
            partitions: self.partitions,
            credentials: self.credentials,
            schemas: self.schemas,
        };
        debug!("server config: {config:?}");

        let server = engine::start(&config).await?;
        let fixture = FixtureHandle::new(config, workspace, reservation, server);

        if let Err(e) = import_all(&fixture, &self.imports).await {
            if let Err(stop) = fixture.shutdown().await {
                warn!("failed to stop slapd after import error: {stop}");
            }
            return Err(e);
        }

        info!("fixture ready on {}", fixture.url());
        Ok(fixture)
    }
}

async fn import_all(fixture: &FixtureHandle, imports: &[LdifSource]) -> Result<()> {
    let mut session = AdminSession::open(fixture.url(), fixture.credentials()).await?;
    for source in imports {
        match source {
            LdifSource::Text(text) => {
                let applied = session.import(Cursor::new(text.clone().into_bytes())).await?;
                debug!("imported {applied} records from text");
            }
            LdifSource::File(file) => {
                session.import_file(file).await?;
            }
        }
    }
    session.close().await;
    Ok(())
}
