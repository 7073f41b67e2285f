use ldap3::{LdapConnAsync, Scope, SearchEntry};
use ldapd_fixture::{provision, Error, FixtureBuilder, FixtureHandle, ImportError};

mod common;

use common::fixture;

async fn search(server: &FixtureHandle, filter: &str) -> Vec<SearchEntry> {
    let (conn, mut ldap) = LdapConnAsync::new(server.url()).await.unwrap();
    ldap3::drive!(conn);
    ldap.simple_bind(server.principal(), server.secret())
        .await
        .unwrap()
        .success()
        .unwrap();
    let (entries, _) = ldap
        .search(server.base_dn(), Scope::Subtree, filter, vec!["*"])
        .await
        .unwrap()
        .success()
        .unwrap();
    ldap.unbind().await.unwrap();

    let mut entries = entries
        .into_iter()
        .map(SearchEntry::construct)
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| a.dn.cmp(&b.dn));
    entries
}

fn dns(entries: &[SearchEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.dn.as_str()).collect()
}

#[tokio::test]
async fn empty_ldif_serves_test_partition() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");

    let server = provision(&data, fixture("empty.ldif")).await.unwrap();

    assert_eq!(server.base_dn(), "o=test");
    assert_eq!(server.data_dir(), data);
    let entries = search(&server, "(objectClass=organization)").await;
    assert_eq!(dns(&entries), vec!["o=test"]);
    assert_eq!(entries[0].attrs["o"], vec!["test".to_string()]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_data_directory_is_wiped() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    std::fs::create_dir_all(data.join("test")).unwrap();
    std::fs::write(data.join("stale.txt"), "left over").unwrap();
    std::fs::write(data.join("test/data.mdb"), "corrupt").unwrap();

    let server = provision(&data, fixture("empty.ldif")).await.unwrap();

    assert!(!data.join("stale.txt").exists());
    assert!(data.join("config").is_dir());
    assert_eq!(dns(&search(&server, "(objectClass=*)").await), vec!["o=test"]);
}

#[tokio::test]
async fn imported_entries_are_searchable() {
    let root = tempfile::tempdir().unwrap();

    let server = provision(root.path().join("data"), fixture("people.ldif"))
        .await
        .unwrap();

    let people = search(&server, "(objectClass=person)").await;
    assert_eq!(dns(&people), vec!["cn=a,o=test", "cn=b,o=test"]);
    assert_eq!(
        people[1].attrs["description"],
        vec!["a description long enough to be folded over two lines".to_string()]
    );
}

#[tokio::test]
async fn malformed_ldif_fails_with_import_error() {
    let root = tempfile::tempdir().unwrap();

    let err = provision(root.path().join("data"), fixture("malformed.ldif"))
        .await
        .unwrap_err();

    let Error::Import(ImportError::Parse(parse)) = &err else {
        panic!("expected parse error, got {err:?}");
    };
    assert_eq!(parse.line, 7);
    assert!(err.to_string().starts_with("import error"));
}

#[tokio::test]
async fn missing_ldif_file_fails_with_import_error() {
    let root = tempfile::tempdir().unwrap();

    let err = provision(root.path().join("data"), root.path().join("missing.ldif"))
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::Import(ImportError::Read { .. })),
        "{err:?}"
    );
}

#[tokio::test]
async fn failed_import_keeps_earlier_records() {
    let server = FixtureBuilder::new().run().await.unwrap();

    let err = server
        .import_ldif(
            "dn: cn=first,o=test
objectClass: person
cn: first
sn: First

dn: cn=second,o=missing
objectClass: person
cn: second
sn: Second

dn: cn=third,o=test
objectClass: person
cn: third
sn: Third",
        )
        .await
        .unwrap_err();

    assert!(
        matches!(&err, Error::Import(ImportError::Apply { dn, .. }) if dn == "cn=second,o=missing"),
        "{err:?}"
    );
    let people = search(&server, "(objectClass=person)").await;
    assert_eq!(dns(&people), vec!["cn=first,o=test"]);
}

#[tokio::test]
async fn malformed_record_keeps_earlier_records() {
    let server = FixtureBuilder::new().run().await.unwrap();

    let err = server
        .import_ldif(
            "dn: cn=first,o=test
objectClass: person
cn: first
sn: First

dn: cn=second,o=test
objectClass person
cn: second
sn: Second",
        )
        .await
        .unwrap_err();

    let Error::Import(ImportError::Parse(parse)) = &err else {
        panic!("expected parse error, got {err:?}");
    };
    assert_eq!(parse.line, 7);
    let people = search(&server, "(objectClass=person)").await;
    assert_eq!(dns(&people), vec!["cn=first,o=test"]);
}

#[tokio::test]
async fn values_are_read_from_file_urls() {
    let root = tempfile::tempdir().unwrap();
    let description = root.path().join("description.txt");
    std::fs::write(&description, "read from a file").unwrap();
    let url = url::Url::from_file_path(&description).unwrap();

    let server = FixtureBuilder::new()
        .add(&format!(
            "dn: cn=filed,o=test
objectClass: person
cn: filed
sn: Filed
description:< {url}"
        ))
        .run()
        .await
        .unwrap();

    let people = search(&server, "(cn=filed)").await;
    assert_eq!(
        people[0].attrs["description"],
        vec!["read from a file".to_string()]
    );
}

#[tokio::test]
async fn principal_inside_test_partition() {
    let server = FixtureBuilder::new()
        .credentials("cn=admin,o=test", "changeit")
        .add_file(fixture("people.ldif"))
        .run()
        .await
        .unwrap();

    assert_eq!(server.principal(), "cn=admin,o=test");
    assert!(!server.data_dir().join("system").exists());
    let people = search(&server, "(objectClass=person)").await;
    assert_eq!(dns(&people), vec!["cn=a,o=test", "cn=b,o=test"]);
}

#[tokio::test]
async fn change_records_are_applied() {
    let server = FixtureBuilder::new()
        .add_file(fixture("people.ldif"))
        .run()
        .await
        .unwrap();

    let applied = server
        .import_ldif(
            "dn: cn=a,o=test
changetype: modify
replace: sn
sn: Aleph
-
add: description
description: first letter
-

dn: cn=b,o=test
changetype: delete

dn: cn=a,o=test
changetype: modrdn
newrdn: cn=z
deleteoldrdn: 1
",
        )
        .await
        .unwrap();

    assert_eq!(applied, 3);
    let people = search(&server, "(objectClass=person)").await;
    assert_eq!(dns(&people), vec!["cn=z,o=test"]);
    assert_eq!(people[0].attrs["sn"], vec!["Aleph".to_string()]);
    assert_eq!(people[0].attrs["cn"], vec!["z".to_string()]);
}

#[tokio::test]
async fn running_fixtures_get_different_ports() {
    let root = tempfile::tempdir().unwrap();

    let first = provision(root.path().join("first"), fixture("empty.ldif"))
        .await
        .unwrap();
    let second = provision(root.path().join("second"), fixture("empty.ldif"))
        .await
        .unwrap();

    assert_ne!(first.port(), second.port());
    assert_eq!(first.url(), format!("ldap://localhost:{}", first.port()));
    assert_eq!(second.url(), format!("ldap://localhost:{}", second.port()));
    assert_eq!(first.config().listen_port, first.port());
}

#[tokio::test]
async fn explicit_port_and_credentials() {
    let port = portpicker::pick_unused_port().unwrap();

    let server = FixtureBuilder::new()
        .port(port)
        .credentials("cn=root,dc=admins", "changeit")
        .add("dn: ou=people,o=test
objectClass: organizationalUnit
ou: people")
        .run()
        .await
        .unwrap();

    assert_eq!(server.url(), format!("ldap://localhost:{port}"));
    assert_eq!(server.principal(), "cn=root,dc=admins");
    let units = search(&server, "(objectClass=organizationalUnit)").await;
    assert_eq!(dns(&units), vec!["ou=people,o=test"]);
}

#[tokio::test]
async fn shutdown_frees_the_port() {
    let server = FixtureBuilder::new().run().await.unwrap();
    let port = server.port();
    let dir = server.data_dir().to_path_buf();

    server.shutdown().await.unwrap();

    assert!(portpicker::is_free_tcp(port));
    assert!(!dir.exists());
}

#[tokio::test]
async fn clone_copies_the_data_directory() {
    let root = tempfile::tempdir().unwrap();
    let server = FixtureBuilder::new().run().await.unwrap();
    let applied = server
        .import_ldif_file(fixture("people.ldif"))
        .await
        .unwrap();
    assert_eq!(applied, 2);

    let snapshot = root.path().join("snapshot");
    server.clone_to_dir(&snapshot).await.unwrap();

    assert!(snapshot.join("config").is_dir());
    assert!(snapshot.join("test").is_dir());
}
