use ldap3::{Ldap, LdapConnAsync, LdapError, Mod};
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::ImportError;
use crate::ldif::{LdifReader, LdifRecord, Modification};

const PARSED_RECORDS: usize = 16;

/// Administrative connection bound with the fixture credentials
pub(crate) struct AdminSession {
    ldap: Ldap,
}

impl AdminSession {
    /// Connect to `url` and simple bind
    pub(crate) async fn open(url: &str, credentials: &Credentials) -> Result<Self, ImportError> {
        let bind_error = |source: LdapError| ImportError::Bind {
            principal: credentials.principal.clone(),
            source,
        };

        let (conn, mut ldap) = LdapConnAsync::new(url).await.map_err(bind_error)?;
        ldap3::drive!(conn);

        ldap.simple_bind(&credentials.principal, &credentials.secret)
            .await
            .and_then(|r| r.success())
            .map_err(bind_error)?;
        debug!("bound to {url} as {}", credentials.principal);

        Ok(AdminSession { ldap })
    }

    /// Apply one record
    pub(crate) async fn apply(&mut self, record: &LdifRecord) -> Result<(), ImportError> {
        debug!("applying {record:?}");
        let result = match record {
            LdifRecord::Add(entry) => {
                let attrs = entry
                    .attributes()
                    .iter()
                    .map(|(name, values)| {
                        (name.as_bytes().to_vec(), values.iter().cloned().collect())
                    })
                    .collect::<Vec<(Vec<u8>, HashSet<Vec<u8>>)>>();
                self.ldap.add(entry.dn(), attrs).await
            }
            LdifRecord::Delete { dn } => self.ldap.delete(dn).await,
            LdifRecord::Modify { dn, mods } => {
                let mods = mods.iter().map(to_ldap_mod).collect::<Vec<_>>();
                self.ldap.modify(dn, mods).await
            }
            LdifRecord::ModDn {
                dn,
                new_rdn,
                delete_old_rdn,
                new_superior,
            } => {
                self.ldap
                    .modifydn(dn, new_rdn, *delete_old_rdn, new_superior.as_deref())
                    .await
            }
        };

        result
            .and_then(|r| r.success())
            .map(|_| ())
            .map_err(|source| ImportError::Apply {
                dn: record.dn().to_string(),
                source,
            })
    }

    /// Apply every record of `reader` in order, stopping at the first failure
    ///
    /// Records applied before the failure stay in the directory. Parsing,
    /// including `:<` file reads, runs on a blocking thread.
    pub(crate) async fn import<R>(&mut self, reader: R) -> Result<usize, ImportError>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(PARSED_RECORDS);
        task::spawn_blocking(move || {
            for record in LdifReader::new(reader) {
                // receiver gone: the import stopped at a failing record
                if tx.blocking_send(record).is_err() {
                    break;
                }
            }
        });

        let mut applied = 0;
        while let Some(record) = rx.recv().await {
            self.apply(&record?).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Stream the LDIF file at `path` into the directory
    pub(crate) async fn import_file(&mut self, path: &Path) -> Result<usize, ImportError> {
        let read_error = |source: std::io::Error| ImportError::Read {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).await.map_err(read_error)?;
        let file = file.into_std().await;
        let applied = self.import(BufReader::new(file)).await?;
        info!("imported {applied} records from {}", path.display());
        Ok(applied)
    }

    /// Unbind, errors are only logged
    pub(crate) async fn close(mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!("unbind failed: {e}");
        }
    }
}

fn to_ldap_mod(modification: &Modification) -> Mod<Vec<u8>> {
    let values = |v: &[Vec<u8>]| v.iter().cloned().collect::<HashSet<_>>();
    match modification {
        Modification::Add(attr, v) => Mod::Add(attr.as_bytes().to_vec(), values(v)),
        Modification::Delete(attr, v) => Mod::Delete(attr.as_bytes().to_vec(), values(v)),
        Modification::Replace(attr, v) => Mod::Replace(attr.as_bytes().to_vec(), values(v)),
        Modification::Increment(attr, v) => Mod::Increment(attr.as_bytes().to_vec(), v.clone()),
    }
}
