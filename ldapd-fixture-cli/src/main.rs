use anyhow::Context;
use clap::Parser;
use ldapd_fixture::{FixtureBuilder, DEFAULT_PRINCIPAL, DEFAULT_SECRET};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Throwaway LDAP server for tests: prints its URL and runs until terminated
#[derive(Parser, Debug)]
#[command(name = "ldapd", author, version, about, long_about = None)]
struct Args {
    /// Data directory, wiped before the server starts
    #[arg(value_name = "DATA_DIRECTORY")]
    data_dir: PathBuf,

    /// LDIF file imported into o=test, or a directory of *.ldif files
    #[arg(value_name = "LDIF_FILE")]
    ldif: PathBuf,

    /// Listen host, also used in the printed URL
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Listen port instead of the first free one from 1024
    #[arg(long)]
    port: Option<u16>,

    /// Administrator bind DN
    #[arg(long, default_value = DEFAULT_PRINCIPAL)]
    principal: String,

    /// Administrator password
    #[arg(long, default_value = DEFAULT_SECRET)]
    secret: String,

    /// Extra schema LDIF, from the slapd schema directory unless absolute
    #[arg(long)]
    schema: Vec<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };
    info!("args: {args:?}");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut builder = FixtureBuilder::new()
        .data_dir(&args.data_dir)
        .host(&args.host)
        .credentials(&args.principal, &args.secret);

    if let Some(port) = args.port {
        builder = builder.port(port);
    }

    for schema in &args.schema {
        info!("add schema file {}", schema.display());
        builder = builder.schema(schema);
    }

    let ldif_files = if tokio::fs::metadata(&args.ldif)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        list_ldif_files(&args.ldif)
            .await
            .with_context(|| format!("cannot list ldif files from {}", args.ldif.display()))?
    } else {
        vec![args.ldif.clone()]
    };

    for ldif in ldif_files {
        info!("add data file {}", ldif.display());
        builder = builder.add_file(ldif);
    }

    let fixture = builder.run().await.with_context(|| {
        format!(
            "cannot provision LDAP server in {}",
            args.data_dir.display()
        )
    })?;

    // the URL on stdout is what callers wait for
    println!("{}", fixture.url());

    info!(
        "ldapsearch -x -H \"{}\" -D \"{}\" -w \"{}\" -b \"{}\" \"(objectClass=*)\"",
        fixture.url(),
        fixture.principal(),
        fixture.secret(),
        fixture.base_dn(),
    );

    info!("waiting for ctrl-c or SIGTERM");
    wait_for_termination().await?;

    fixture.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() -> anyhow::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to listen for SIGTERM")?;
    tokio::select! {
        res = signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_termination() -> anyhow::Result<()> {
    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}

async fn list_ldif_files<P: AsRef<Path>>(dir: P) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut ret = vec![];

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension() == Some(OsStr::new("ldif")) {
            ret.push(path)
        } else {
            warn!("Ignoring file {}", path.display());
        }
    }

    ret.sort();

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn parses_positional_arguments() {
        let args = Args::try_parse_from(["ldapd", "/tmp/data", "/tmp/test.ldif"]).unwrap();
        assert_eq!(args.data_dir, PathBuf::from("/tmp/data"));
        assert_eq!(args.ldif, PathBuf::from("/tmp/test.ldif"));
        assert_eq!(args.host, "localhost");
        assert_eq!(args.principal, "uid=admin,ou=system");
        assert_eq!(args.secret, "secret");
        assert!(args.port.is_none());
    }

    #[test]
    fn missing_arguments_is_usage_error() {
        for argv in [vec!["ldapd"], vec!["ldapd", "/tmp/data"]] {
            let err = Args::try_parse_from(argv).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
            assert!(err.use_stderr());
            assert!(err.to_string().contains("<DATA_DIRECTORY> <LDIF_FILE>"));
        }
    }

    #[tokio::test]
    async fn lists_only_ldif_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.ldif", "a.ldif", "notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }

        let files = list_ldif_files(dir.path()).await.unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a.ldif"), dir.path().join("b.ldif")]
        );
    }
}
