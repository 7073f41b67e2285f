//! Syntax checks for distinguished names (RFC 4514).

/// `true` for a descriptor (`cn`, `objectClass`) or a numeric OID (`2.5.4.3`)
pub(crate) fn valid_attribute_type(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        }
        Some(c) if c.is_ascii_digit() => {
            !name.ends_with('.')
                && !name.contains("..")
                && name.chars().all(|c| c.is_ascii_digit() || c == '.')
        }
        _ => false,
    }
}

/// Split on `sep` where it is not escaped with `\` or inside double quotes
pub(crate) fn split_unescaped(text: &str, sep: char) -> Option<Vec<&str>> {
    let mut parts = vec![];
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;

    for (idx, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&text[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }

    if escaped || quoted {
        return None;
    }
    parts.push(&text[start..]);
    Some(parts)
}

fn valid_rdn(rdn: &str) -> bool {
    let Some(avas) = split_unescaped(rdn, '+') else {
        return false;
    };
    avas.iter().all(|ava| match ava.split_once('=') {
        Some((name, _)) => valid_attribute_type(name.trim()),
        None => false,
    })
}

/// `true` when `dn` is a non-empty, well formed distinguished name
pub fn is_valid(dn: &str) -> bool {
    if dn.trim().is_empty() {
        return false;
    }
    match split_unescaped(dn, ',') {
        Some(rdns) => rdns.iter().all(|rdn| valid_rdn(rdn)),
        None => false,
    }
}

/// `true` when `dn` equals `suffix` or lies below it, ignoring case and spaces around separators
pub fn is_within(dn: &str, suffix: &str) -> bool {
    let normalize = |value: &str| -> Vec<String> {
        split_unescaped(value, ',')
            .unwrap_or_default()
            .into_iter()
            .map(|rdn| match rdn.split_once('=') {
                Some((name, value)) => format!("{}={}", name.trim(), value.trim()),
                None => rdn.trim().to_string(),
            })
            .map(|rdn| rdn.to_ascii_lowercase())
            .collect()
    };
    let dn = normalize(dn);
    let suffix = normalize(suffix);
    !suffix.is_empty() && dn.len() >= suffix.len() && dn.ends_with(&suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_usual_dns() {
        for dn in [
            "o=test",
            "uid=admin,ou=system",
            "cn=Philip J. Fry,ou=people,dc=planetexpress,dc=com",
            "cn=Amy Wong+sn=Kroker,ou=people,o=test",
            r"cn=Smith\, John,o=test",
            r#"cn="Smith, John",o=test"#,
            "2.5.4.3=a,o=test",
        ] {
            assert!(is_valid(dn), "{dn} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_dns() {
        for dn in ["", "  ", "test", "o=test,", "=a,o=test", "cn=a,,o=test", r"cn=a\", "1a=b"] {
            assert!(!is_valid(dn), "{dn:?} should be invalid");
        }
    }

    #[test]
    fn checks_suffix() {
        assert!(is_within("cn=a,o=test", "o=test"));
        assert!(is_within("O=Test", "o=test"));
        assert!(is_within("cn=a, o=test", "o=test"));
        assert!(!is_within("cn=a,o=other", "o=test"));
        assert!(!is_within("o=test", "cn=a,o=test"));
    }
}
