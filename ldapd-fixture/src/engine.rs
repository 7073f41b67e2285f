//! Drives OpenLDAP `slapd`: renders `cn=config`, loads it with `slapadd` and
//! supervises the server process.
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info};
use url::Url;

use crate::config::{PartitionConfig, ServerConfig};
use crate::dn;
use crate::error::{Error, Result};

const SLAPD_LDIF: &str = include_str!("slapd.ldif");
const START_TIMEOUT: Duration = Duration::from_secs(60);
const POSSIBLE_SCHEMA_DIR: &[&str] = &[
    "/etc/ldap/schema",
    "/usr/local/etc/openldap/schema",
    "/etc/openldap/schema/",
];
const POSSIBLE_MODULE_DIR: &[&str] = &[
    "/usr/lib/ldap",
    "/usr/lib/openldap",
    "/usr/lib64/openldap",
    "/usr/local/libexec/openldap",
];

/// Render the `cn=config` database: global settings, schemas and one mdb per partition
pub(crate) fn render_config(
    config: &ServerConfig,
    schema_dir: &Path,
    module_dir: Option<&Path>,
) -> Result<String> {
    let work_dir = config.working_directory.display().to_string();

    let modules = match module_dir {
        Some(dir) => format!(
            "dn: cn=module{{0}},cn=config
objectClass: olcModuleList
cn: module{{0}}
olcModulePath: {}
olcModuleLoad: back_mdb

",
            dir.display()
        ),
        None => String::new(),
    };

    let mut schemas = String::new();
    for schema in &config.schemas {
        let file = schema_dir.join(schema);
        let url = Url::from_file_path(&file)
            .map_err(|_| Error::engine(format!("invalid schema path {}", file.display())))?;
        schemas.push_str(&format!("include: {url}\n"));
    }

    let mut ldif = SLAPD_LDIF
        .replace("@WORKDIR@", &work_dir)
        .replace("@MODULES@\n", &modules)
        .replace("@SCHEMAS@", &schemas);

    let principal = &config.credentials.principal;
    let system = config.system_partition()?;
    let databases = system
        .iter()
        .map(|p| (p, false))
        .chain(config.partitions.iter().map(|p| (p, true)));
    for (idx, (partition, user)) in databases.enumerate() {
        let idx = idx + 1;
        let db_dir = database_dir(config, partition);
        ldif.push_str(&format!(
            "dn: olcDatabase={{{idx}}}mdb,cn=config
objectClass: olcDatabaseConfig
objectClass: olcMdbConfig
olcDatabase: {{{idx}}}mdb
olcSuffix: {}
olcDbDirectory: {}
",
            partition.suffix,
            db_dir.display(),
        ));
        for attr in &partition.indexed_attributes {
            ldif.push_str(&format!("olcDbIndex: {attr} eq\n"));
        }
        if dn::is_within(principal, &partition.suffix) {
            ldif.push_str(&format!(
                "olcRootDN: {principal}\nolcRootPW: {}\n",
                config.credentials.secret
            ));
        }
        if user {
            ldif.push_str(&format!(
                "olcAccess: {{0}}to attrs=userPassword by dn.exact=\"{principal}\" manage by self write by anonymous auth by * none
olcAccess: {{1}}to * by dn.exact=\"{principal}\" manage by * read
"
            ));
        }
        ldif.push('\n');
    }

    Ok(ldif)
}

fn database_dir(config: &ServerConfig, partition: &PartitionConfig) -> PathBuf {
    config.working_directory.join(&partition.name)
}

/// Write slapd configuration and partition root entries into the working directory
async fn build_database(config: &ServerConfig, schema_dir: &Path) -> Result<PathBuf> {
    let work_dir = &config.working_directory;
    let io_err = |what: &str, path: &Path, e: std::io::Error| {
        Error::engine(format!("cannot {what} {}: {e}", path.display()))
    };

    let module_dir = find_dir(POSSIBLE_MODULE_DIR, |dir| dir.join("back_mdb.so")).await;
    let ldif = render_config(config, schema_dir, module_dir)?;

    let config_ldif = work_dir.join("config.ldif");
    fs::write(&config_ldif, ldif)
        .await
        .map_err(|e| io_err("write", &config_ldif, e))?;

    let config_dir = work_dir.join("config");
    fs::create_dir(&config_dir)
        .await
        .map_err(|e| io_err("create", &config_dir, e))?;
    slapadd(&config_dir, &["-n", "0"], &config_ldif).await?;

    for partition in config.all_partitions()? {
        let db_dir = database_dir(config, &partition);
        fs::create_dir(&db_dir)
            .await
            .map_err(|e| io_err("create", &db_dir, e))?;

        let root_ldif = work_dir.join(format!("{}.ldif", partition.name));
        fs::write(&root_ldif, partition.root_ldif())
            .await
            .map_err(|e| io_err("write", &root_ldif, e))?;
        slapadd(&config_dir, &["-b", &partition.suffix], &root_ldif).await?;
    }

    Ok(config_dir)
}

async fn slapadd(config_dir: &Path, target: &[&str], file: &Path) -> Result<()> {
    debug!("slapadd {target:?} file: {}", file.display());

    let output = Command::new("slapadd")
        .arg("-F")
        .arg(config_dir)
        .args(target)
        .arg("-l")
        .arg(file)
        .output()
        .await
        .map_err(|e| Error::engine(format!("failed to execute slapadd: {e}")))?;

    if !output.status.success() {
        return Err(Error::engine(format!(
            "slapadd command exited with error {}, stdout: {}, stderr: {} on file {}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
            file.display()
        )));
    }
    Ok(())
}

/// Configure the working directory and start `slapd` on it
///
/// Returns once slapd logged its start and the listen port accepts connections.
pub(crate) async fn start(config: &ServerConfig) -> Result<Child> {
    config.validate()?;

    let schema_dir = find_dir(POSSIBLE_SCHEMA_DIR, |dir| dir.to_path_buf())
        .await
        .ok_or_else(|| {
            Error::engine("no slapd schema directory found. Is openldap server installed?")
        })?;
    let config_dir = build_database(config, schema_dir).await?;

    let url = config.ldap_url();
    let mut server = Command::new("slapd")
        .arg("-F")
        .arg(&config_dir)
        .arg("-d")
        .arg("2048")
        .arg("-h")
        .arg(format!("{url}/"))
        .stderr(Stdio::piped())
        .kill_on_drop(config.shutdown_hook_enabled)
        .spawn()
        .map_err(|e| Error::engine(format!("failed to execute slapd: {e}")))?;

    // wait until slapd server has started
    let Some(stderr) = server.stderr.take() else {
        return Err(Error::engine("slapd stderr is not captured"));
    };
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    let mut log = vec![];
    let started = timeout(START_TIMEOUT, async {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("slapd: {line}");
            if line.ends_with("slapd starting") {
                return true;
            }
            log.push(line);
        }
        false
    })
    .await;

    if started != Ok(true) {
        let _ = server.kill().await;
        let reason = if started.is_err() { "timeout" } else { "exited" };
        return Err(Error::engine(format!(
            "failed to start slapd server ({reason}): {}",
            log.join("\n")
        )));
    }

    // keep draining stderr so slapd never blocks on a full pipe
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("slapd: {line}");
        }
    });

    let host = config.host.clone();
    let port = config.listen_port;
    let opened = timeout(START_TIMEOUT, async {
        while !is_tcp_port_open(&host, port).await {
            debug!("tcp port {port} is not open yet, waiting...");
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if opened.is_err() {
        let _ = server.kill().await;
        return Err(Error::engine(format!(
            "failed to start slapd server, port {port} not open"
        )));
    }

    info!("started ldap server on {url}, pid: {:?}", server.id());
    Ok(server)
}

async fn find_dir<F>(candidates: &'static [&'static str], probe: F) -> Option<&'static Path>
where
    F: Fn(&Path) -> PathBuf,
{
    for dir in candidates {
        let dir: &Path = dir.as_ref();
        if fs::metadata(probe(dir)).await.is_ok() {
            return Some(dir);
        }
    }
    None
}

async fn is_tcp_port_open(host: &str, port: u16) -> bool {
    let Some(addr) = (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) else {
        return false;
    };
    let Ok(sock) = timeout(Duration::from_secs(1), TcpStream::connect(&addr)).await else {
        return false;
    };
    sock.is_ok()
}
