use futures_util::TryStreamExt;
use ldap_rs::{LdapClient, SearchRequest, SearchRequestScope};
use ldapd_fixture::FixtureBuilder;

mod common;

use common::fixture;

#[tokio::test]
async fn test_bind() {
    let server = FixtureBuilder::new().run().await.unwrap();

    let mut client = LdapClient::builder(server.host())
        .port(server.port())
        .connect()
        .await
        .unwrap();
    client
        .simple_bind(server.principal(), server.secret())
        .await
        .unwrap();

    let authz = client.whoami().await.unwrap();
    assert_eq!(authz.as_deref(), Some("dn:uid=admin,ou=system"));

    client.unbind().await.unwrap();
}

#[tokio::test]
async fn test_invalid_password() {
    let server = FixtureBuilder::new().run().await.unwrap();

    let mut client = LdapClient::builder(server.host())
        .port(server.port())
        .connect()
        .await
        .unwrap();

    let result = client
        .simple_bind(server.principal(), &format!("{}_invalid", server.secret()))
        .await;
    assert!(result.is_err(), "bind with a wrong password succeeded");
}

#[tokio::test]
async fn test_query() {
    let server = FixtureBuilder::new()
        .add(
            "dn: ou=people,o=test
objectClass: top
objectClass: organizationalUnit
description: Planet Express crew
ou: people

dn: cn=Philip J. Fry,ou=people,o=test
objectClass: inetOrgPerson
objectClass: organizationalPerson
objectClass: person
objectClass: top
cn: Philip J. Fry
givenName: Philip
sn: Fry",
        )
        .add_file(fixture("people.ldif"))
        .run()
        .await
        .unwrap();

    let mut client = LdapClient::builder(server.host())
        .port(server.port())
        .connect()
        .await
        .unwrap();
    client
        .simple_bind(server.principal(), server.secret())
        .await
        .unwrap();

    let result = client
        .search(
            SearchRequest::builder()
                .base_dn(server.base_dn())
                .scope(SearchRequestScope::WholeSubtree)
                .filter("(objectClass=inetOrgPerson)")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let items = result.try_collect::<Vec<_>>().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].dn, "cn=Philip J. Fry,ou=people,o=test");

    server
        .import_ldif(
            "dn: cn=Turanga Leela,ou=people,o=test
objectClass: inetOrgPerson
objectClass: organizationalPerson
objectClass: person
objectClass: top
cn: Turanga Leela
sn: Turanga
description: Mutant
employeeType: Captain
employeeType: Pilot
givenName: Leela",
        )
        .await
        .unwrap();

    let item = client
        .search_one(
            SearchRequest::builder()
                .base_dn(server.base_dn())
                .scope(SearchRequestScope::WholeSubtree)
                .filter("(&(objectClass=inetOrgPerson)(sn=Turanga))")
                .build()
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(item.dn, "cn=Turanga Leela,ou=people,o=test");

    let item = client
        .search_one(
            SearchRequest::builder()
                .base_dn(server.base_dn())
                .scope(SearchRequestScope::WholeSubtree)
                .filter("(cn=b)")
                .build()
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(item.dn, "cn=b,o=test");

    client.unbind().await.unwrap();
}
