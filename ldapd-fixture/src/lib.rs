//! This crate runs a throwaway OpenLDAP (slapd) directory for integration tests.
//!
//! The data directory is wiped, a free port is picked from 1024 upward, the
//! `o=test` partition is created and LDIF records are imported before the
//! handle is returned.
//!
//! # Examples
//!
//! ```no_run
//! use ldapd_fixture::{FixtureBuilder, FixtureHandle};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ldapd_fixture::Result<()> {
//! let fixture: FixtureHandle = FixtureBuilder::new()
//!     .data_dir("target/ldapd")
//!     // imported in order once slapd runs
//!     .add("dn: ou=people,o=test
//! objectClass: top
//! objectClass: organizationalUnit
//! ou: people")
//!     .run()
//!     .await?;
//!
//! // Add entries to the running server
//! fixture.import_ldif("dn: cn=Turanga Leela,ou=people,o=test
//! objectClass: inetOrgPerson
//! objectClass: organizationalPerson
//! objectClass: person
//! objectClass: top
//! cn: Turanga Leela
//! sn: Turanga
//! givenName: Leela").await?;
//!
//! assert!(fixture.url().starts_with("ldap://localhost:"));
//! fixture.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
#![warn(missing_docs)]
use dircpy::copy_dir;
use std::io::Cursor;
use std::path::Path;
use tokio::process::Child;
use tokio::task;
use tracing::{debug, info, warn};

mod builder;
mod config;
pub mod dn;
mod engine;
mod error;
mod import;
pub mod ldif;
mod port;
mod workspace;

pub use builder::FixtureBuilder;
pub use config::{
    Credentials, PartitionConfig, ServerConfig, DEFAULT_PRINCIPAL, DEFAULT_SECRET, TEST_BASE_DN,
};
pub use error::{Error, ImportError, Result};
pub use port::{PortReservation, DEFAULT_PORT_START, PORT_CEILING};
pub use workspace::Workspace;

use import::AdminSession;

/// Wipe `data_dir`, start slapd with the `o=test` partition and import `ldif`
///
/// Shorthand for [`FixtureBuilder`] with a data directory and one LDIF file.
pub async fn provision<D, L>(data_dir: D, ldif: L) -> Result<FixtureHandle>
where
    D: AsRef<Path>,
    L: AsRef<Path>,
{
    FixtureBuilder::new()
        .data_dir(data_dir)
        .add_file(ldif)
        .run()
        .await
}

/// Running directory server
#[derive(Debug)]
pub struct FixtureHandle {
    url: String,
    config: ServerConfig,
    _reservation: PortReservation,
    server: Option<Child>,
    // dropped last so a temporary directory outlives slapd
    workspace: Workspace,
}

impl FixtureHandle {
    pub(crate) fn new(
        config: ServerConfig,
        workspace: Workspace,
        reservation: PortReservation,
        server: Child,
    ) -> Self {
        FixtureHandle {
            url: config.ldap_url(),
            config,
            _reservation: reservation,
            server: Some(server),
            workspace,
        }
    }

    /// Return URL (schema=ldap, host and port) to this LDAP server
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hostname of this LDAP server
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// TCP port number of this LDAP server
    pub fn port(&self) -> u16 {
        self.config.listen_port
    }

    /// Base DN of the first partition, `o=test` unless replaced
    pub fn base_dn(&self) -> &str {
        self.config
            .partitions
            .first()
            .map(|p| p.suffix.as_str())
            .unwrap_or(TEST_BASE_DN)
    }

    /// Administrator account
    pub fn credentials(&self) -> &Credentials {
        &self.config.credentials
    }

    /// Administrator bind DN
    pub fn principal(&self) -> &str {
        &self.config.credentials.principal
    }

    /// Administrator password
    pub fn secret(&self) -> &str {
        &self.config.credentials.secret
    }

    /// Configuration slapd was started with
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// LDAP server data directory
    pub fn data_dir(&self) -> &Path {
        self.workspace.path()
    }

    /// Copy LDAP server files to a new location
    pub async fn clone_to_dir<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let src = self.workspace.path().to_path_buf();
        let dst = dest.as_ref().to_path_buf();
        task::spawn_blocking(move || copy_dir(&src, &dst))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    /// Apply LDIF records from text, returns how many were applied
    ///
    /// Stops at the first failing record; earlier records stay applied.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use ldapd_fixture::FixtureBuilder;
    /// #
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// # let fixture = FixtureBuilder::new().run().await.unwrap();
    /// #
    /// fixture.import_ldif("dn: cn=Philip J. Fry,o=test
    /// objectClass: person
    /// cn: Philip J. Fry
    /// sn: Fry
    ///
    /// dn: cn=Philip J. Fry,o=test
    /// changetype: modify
    /// add: description
    /// description: delivery boy
    /// -").await.unwrap();
    /// # }
    /// ```
    pub async fn import_ldif(&self, ldif: &str) -> Result<usize> {
        let mut session = AdminSession::open(self.url(), self.credentials()).await?;
        let applied = session.import(Cursor::new(ldif.as_bytes().to_vec())).await;
        session.close().await;
        Ok(applied?)
    }

    /// Apply LDIF records from a file, returns how many were applied
    pub async fn import_ldif_file<P: AsRef<Path>>(&self, file: P) -> Result<usize> {
        let mut session = AdminSession::open(self.url(), self.credentials()).await?;
        let applied = session.import_file(file.as_ref()).await;
        session.close().await;
        Ok(applied?)
    }

    /// Stop slapd and release the port
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            let pid = server.id();
            server.kill().await?;
            info!("stopped slapd server pid: {pid:?}");
        }
        Ok(())
    }
}

impl Drop for FixtureHandle {
    fn drop(&mut self) {
        let Some(server) = self.server.as_mut() else {
            return;
        };
        if !self.config.shutdown_hook_enabled {
            debug!("leaving slapd server pid {:?} running", server.id());
            return;
        }
        if let Err(e) = server.start_kill() {
            warn!("failed to kill slapd server: {}, pid: {:?}", e, server.id());
        } else {
            debug!("killed slapd server pid: {:?}", server.id());
        }
    }
}
