//! Directory entry to canonical user mapping.

use dirsync::model::first_non_empty;
use dirsync::{CanonicalGroup, CanonicalUser};
use ldap3::SearchEntry;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Group type given to groups discovered through `memberOf`.
pub const LDAP_GROUP_TYPE: &str = "ldap-group";

/// `userAccountControl` bit for a disabled account.
const UAC_ACCOUNTDISABLE: u32 = 0x2;

/// Attributes requested on every user search.
pub fn user_attributes(is_ad: bool) -> Vec<&'static str> {
    let mut attrs = vec![
        "uidNumber",
        "cn",
        "sn",
        "givenName",
        "gidNumber",
        "entryUUID",
        "displayName",
        "mail",
        "email",
        "emailAddress",
        "telephoneNumber",
        "mobile",
        "mobileTelephoneNumber",
        "registeredAddress",
        "postalAddress",
        "c",
        "co",
        "title",
        "memberOf",
    ];
    if is_ad {
        attrs.extend(["sAMAccountName", "objectGUID", "userAccountControl", "userPrincipalName"]);
    } else {
        attrs.push("uid");
    }
    attrs
}

/// RootDSE check: AD advertises a ready global catalog and a forest level
/// but no vendor name or version.
pub fn is_active_directory(root_dse: &SearchEntry) -> bool {
    let vendor_name = first_value(root_dse, "vendorName");
    let vendor_version = first_value(root_dse, "vendorVersion");
    let catalog_ready = first_value(root_dse, "isGlobalCatalogReady");
    let forest = first_value(root_dse, "forestFunctionality");
    vendor_name.is_empty()
        && vendor_version.is_empty()
        && catalog_ready.eq_ignore_ascii_case("TRUE")
        && !forest.is_empty()
}

/// Formats a 16-byte `objectGUID` using the little-endian GUID layout.
/// Any other length yields an empty string.
pub fn decode_object_guid(bytes: &[u8]) -> String {
    match <[u8; 16]>::try_from(bytes) {
        Ok(raw) => Uuid::from_bytes_le(raw).to_string(),
        Err(_) => String::new(),
    }
}

/// Extracts the first `CN=` component of a distinguished name.
pub fn group_name_from_dn(dn: &str) -> Option<String> {
    dn.split(',')
        .map(str::trim)
        .find(|part| part.len() > 3 && part[..3].eq_ignore_ascii_case("cn="))
        .map(|part| part[3..].to_string())
}

/// Case-insensitive attribute lookup. Binary values are decoded lossily
/// and stripped of replacement characters.
fn values(entry: &SearchEntry, name: &str) -> Vec<String> {
    if let Some((_, vals)) = entry.attrs.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        return vals.iter().map(|v| sanitize(v)).collect();
    }
    entry
        .bin_attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, vals)| {
            vals.iter()
                .map(|v| sanitize(&String::from_utf8_lossy(v)))
                .collect()
        })
        .unwrap_or_default()
}

fn first_value(entry: &SearchEntry, name: &str) -> String {
    values(entry, name).into_iter().next().unwrap_or_default()
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER && (!c.is_control() || *c == '\n'))
        .collect()
}

// GUIDs that happen to be valid UTF-8 end up in `attrs`
fn object_guid(entry: &SearchEntry) -> String {
    let binary = entry
        .bin_attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("objectGUID"))
        .and_then(|(_, vals)| vals.first())
        .map(|raw| decode_object_guid(raw));
    let textual = || {
        entry
            .attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("objectGUID"))
            .and_then(|(_, vals)| vals.first())
            .map(|raw| decode_object_guid(raw.as_bytes()))
    };
    binary.or_else(textual).unwrap_or_default()
}

/// Transform a directory entry into a canonical user.
pub fn entry_to_canonical(entry: &SearchEntry) -> CanonicalUser {
    let uid = first_non_empty(&[
        first_value(entry, "uid").as_str(),
        first_value(entry, "sAMAccountName").as_str(),
    ])
    .to_string();
    let cn = first_value(entry, "cn");
    let entry_uuid = first_value(entry, "entryUUID");
    let uuid = first_non_empty(&[entry_uuid.as_str(), object_guid(entry).as_str()]).to_string();

    let id = first_non_empty(&[uuid.as_str(), uid.as_str(), cn.as_str()]).to_string();
    let name = first_non_empty(&[uid.as_str(), cn.as_str()]).to_string();

    let address = first_non_empty(&[
        first_value(entry, "postalAddress").as_str(),
        first_value(entry, "registeredAddress").as_str(),
    ])
    .to_string();

    let uac = first_value(entry, "userAccountControl").parse::<u32>().unwrap_or(0);

    let groups: BTreeSet<String> = values(entry, "memberOf")
        .iter()
        .filter_map(|dn| group_name_from_dn(dn))
        .collect();

    let mut user = CanonicalUser {
        id,
        display_name: first_non_empty(&[first_value(entry, "displayName").as_str(), cn.as_str()])
            .to_string(),
        name,
        first_name: first_value(entry, "givenName"),
        last_name: first_value(entry, "sn"),
        email: first_non_empty(&[
            first_value(entry, "email").as_str(),
            first_value(entry, "emailAddress").as_str(),
            first_value(entry, "mail").as_str(),
        ])
        .to_string(),
        phone: first_non_empty(&[
            first_value(entry, "mobile").as_str(),
            first_value(entry, "mobileTelephoneNumber").as_str(),
            first_value(entry, "telephoneNumber").as_str(),
        ])
        .to_string(),
        title: first_value(entry, "title"),
        address: if address.is_empty() { Vec::new() } else { vec![address] },
        region: first_non_empty(&[
            first_value(entry, "c").as_str(),
            first_value(entry, "co").as_str(),
        ])
        .to_string(),
        is_forbidden: uac & UAC_ACCOUNTDISABLE != 0,
        groups,
        ..Default::default()
    };

    for (key, attr) in [
        ("dn", None),
        ("uidNumber", Some("uidNumber")),
        ("gidNumber", Some("gidNumber")),
        ("userPrincipalName", Some("userPrincipalName")),
    ] {
        let value = match attr {
            Some(attr) => first_value(entry, attr),
            None => entry.dn.clone(),
        };
        if !value.is_empty() {
            user.properties.insert(key.to_string(), value);
        }
    }
    user
}

/// Distinct groups referenced by `memberOf`, as top-level groups.
pub fn groups_from_users(users: &[CanonicalUser]) -> Vec<CanonicalGroup> {
    let names: BTreeSet<&String> = users.iter().flat_map(|u| u.groups.iter()).collect();
    names
        .into_iter()
        .map(|name| CanonicalGroup {
            id: name.clone(),
            name: name.clone(),
            display_name: name.clone(),
            group_type: LDAP_GROUP_TYPE.to_string(),
            is_top_group: true,
            ..Default::default()
        })
        .collect()
}
