use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::dn;
use crate::error::{Error, Result};

/// Suffix of the partition created by [`crate::provision`]
pub const TEST_BASE_DN: &str = "o=test";
/// Default administrator DN
pub const DEFAULT_PRINCIPAL: &str = "uid=admin,ou=system";
/// Default administrator password
pub const DEFAULT_SECRET: &str = "secret";
/// Default listen host, also used in the LDAP URL
pub const DEFAULT_HOST: &str = "localhost";
/// Schema files (from the slapd schema directory) loaded by default
pub const DEFAULT_SCHEMAS: &[&str] = &["core.ldif", "cosine.ldif", "nis.ldif", "inetorgperson.ldif"];

/// Administrator account used to bind and import data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Bind DN
    pub principal: String,
    /// Simple bind password
    pub secret: String,
}

impl Credentials {
    /// Credentials with given bind DN and password
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Credentials {
            principal: principal.into(),
            secret: secret.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::new(DEFAULT_PRINCIPAL, DEFAULT_SECRET)
    }
}

/// Naming context served by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Short name, also the name of its database directory
    pub name: String,
    /// Suffix DN
    pub suffix: String,
    /// Attributes with an equality index
    pub indexed_attributes: BTreeSet<String>,
    /// Attributes of the entry at the suffix
    pub root_entry: BTreeMap<String, Vec<String>>,
}

impl PartitionConfig {
    /// Partition with no index and an empty root entry
    pub fn new(name: impl Into<String>, suffix: impl Into<String>) -> Self {
        PartitionConfig {
            name: name.into(),
            suffix: suffix.into(),
            indexed_attributes: BTreeSet::new(),
            root_entry: BTreeMap::new(),
        }
    }

    /// The `o=test` partition: `objectClass` indexed, root entry is an organization
    pub fn test() -> Self {
        PartitionConfig::new("test", TEST_BASE_DN)
            .index("objectClass")
            .root_attribute("objectClass", "top")
            .root_attribute("objectClass", "organization")
            .root_attribute("o", "test")
    }

    /// Add an equality index
    pub fn index(mut self, attribute: impl Into<String>) -> Self {
        self.indexed_attributes.insert(attribute.into());
        self
    }

    /// Add a value to the root entry
    pub fn root_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let values = self.root_entry.entry(name.into()).or_default();
        let value = value.into();
        if !values.contains(&value) {
            values.push(value);
        }
        self
    }

    fn object_classes(&self) -> impl Iterator<Item = &String> {
        self.root_entry
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("objectClass"))
            .flat_map(|(_, v)| v)
    }

    /// Check suffix syntax and root entry
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Error::engine(format!("invalid partition {:?}: {reason}", self.name))
        };

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("name must be alphanumeric".to_string()));
        }
        if self.name.eq_ignore_ascii_case("config") {
            return Err(invalid("name is reserved for the slapd configuration".to_string()));
        }
        if !dn::is_valid(&self.suffix) {
            return Err(invalid(format!("suffix {:?} is not a DN", self.suffix)));
        }
        if self.object_classes().next().is_none() {
            return Err(invalid("root entry has no objectClass".to_string()));
        }
        Ok(())
    }

    /// Root entry as LDIF
    pub fn root_ldif(&self) -> String {
        let mut ldif = format!("dn: {}\n", self.suffix);
        for (name, values) in &self.root_entry {
            for value in values {
                ldif.push_str(&format!("{name}: {value}\n"));
            }
        }
        ldif
    }

    /// Partition holding the administrator, rooted at the principal's parent
    pub(crate) fn system(credentials: &Credentials) -> Result<Self> {
        let principal = &credentials.principal;
        let bad = |reason: &str| Error::engine(format!("principal {principal:?}: {reason}"));

        if !dn::is_valid(principal) {
            return Err(bad("not a DN"));
        }
        let rdns = dn::split_unescaped(principal, ',').unwrap_or_default();
        let Some(parent_rdns) = rdns.get(1..).filter(|rdns| !rdns.is_empty()) else {
            return Err(bad("must have a parent entry"));
        };
        let parent = parent_rdns.join(",");
        let parent = parent.trim();
        let Some((attr, value)) = parent_rdns[0].split_once('=') else {
            return Err(bad("parent has no RDN"));
        };
        let (attr, value) = (attr.trim(), value.trim());

        let partition = PartitionConfig::new("system", parent).root_attribute("objectClass", "top");
        let partition = match attr.to_ascii_lowercase().as_str() {
            "ou" => partition.root_attribute("objectClass", "organizationalUnit"),
            "o" => partition.root_attribute("objectClass", "organization"),
            "dc" => partition.root_attribute("objectClass", "domain"),
            "cn" => partition.root_attribute("objectClass", "applicationProcess"),
            _ => return Err(bad("parent RDN must be one of ou, o, dc or cn")),
        };
        Ok(partition.root_attribute(attr, value))
    }
}

/// Everything needed to configure and start the directory engine
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Engine data store; must be empty or absent before start
    pub working_directory: PathBuf,
    /// Open a TCP listener
    pub network_enabled: bool,
    /// Listen host
    pub host: String,
    /// Listen port
    pub listen_port: u16,
    /// Kill the engine when the fixture handle is dropped
    pub shutdown_hook_enabled: bool,
    /// User partitions
    pub partitions: Vec<PartitionConfig>,
    /// Administrator account
    pub credentials: Credentials,
    /// Schema files, resolved against the slapd schema directory unless absolute
    pub schemas: Vec<PathBuf>,
}

impl ServerConfig {
    /// Configuration with the `o=test` partition and default credentials
    pub fn new(working_directory: impl Into<PathBuf>, listen_port: u16) -> Self {
        ServerConfig {
            working_directory: working_directory.into(),
            network_enabled: true,
            host: DEFAULT_HOST.to_string(),
            listen_port,
            shutdown_hook_enabled: true,
            partitions: vec![PartitionConfig::test()],
            credentials: Credentials::default(),
            schemas: DEFAULT_SCHEMAS.iter().map(PathBuf::from).collect(),
        }
    }

    /// `ldap://<host>:<port>`
    pub fn ldap_url(&self) -> String {
        format!("ldap://{}:{}", self.host, self.listen_port)
    }

    /// Partition holding the administrator, `None` when a user partition holds it
    pub(crate) fn system_partition(&self) -> Result<Option<PartitionConfig>> {
        let principal = &self.credentials.principal;
        if !dn::is_valid(principal) {
            return Err(Error::engine(format!("principal {principal:?}: not a DN")));
        }
        if self
            .partitions
            .iter()
            .any(|p| dn::is_within(principal, &p.suffix))
        {
            return Ok(None);
        }
        PartitionConfig::system(&self.credentials).map(Some)
    }

    /// System partition, if any, followed by the user partitions
    pub(crate) fn all_partitions(&self) -> Result<Vec<PartitionConfig>> {
        let mut all: Vec<_> = self.system_partition()?.into_iter().collect();
        all.extend(self.partitions.iter().cloned());
        Ok(all)
    }

    /// Check the whole configuration before anything is written to disk
    pub fn validate(&self) -> Result<()> {
        if !self.network_enabled {
            return Err(Error::engine("networking is disabled, nothing would listen"));
        }
        if self.listen_port == 0 {
            return Err(Error::engine("listen port must not be 0"));
        }
        if self.partitions.is_empty() {
            return Err(Error::engine("no partition configured"));
        }

        let all = self.all_partitions()?;
        for (idx, partition) in all.iter().enumerate() {
            partition.validate()?;
            for other in &all[..idx] {
                if other.name.eq_ignore_ascii_case(&partition.name) {
                    return Err(Error::engine(format!(
                        "duplicate partition name {:?}",
                        partition.name
                    )));
                }
                if dn::is_within(&partition.suffix, &other.suffix)
                    || dn::is_within(&other.suffix, &partition.suffix)
                {
                    return Err(Error::engine(format!(
                        "partition suffix {:?} overlaps {:?}",
                        partition.suffix, other.suffix
                    )));
                }
            }
        }
        Ok(())
    }
}
