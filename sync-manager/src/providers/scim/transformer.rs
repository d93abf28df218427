use dirsync::model::{display_name_fallback, first_non_empty};
use dirsync::CanonicalUser;

use super::api::ScimUser;
use crate::providers::primary_or_first;

/// Transform a SCIM user into a canonical user.
///
/// Display name order: `displayName`, `name.formatted`, given + family,
/// `nickName`, `userName`.
pub fn scim_user_to_canonical(scim: &ScimUser) -> CanonicalUser {
    let mut user = CanonicalUser {
        id: scim.id.clone(),
        name: first_non_empty(&[scim.user_name.as_str(), scim.id.as_str()]).to_string(),
        first_name: scim.name.given_name.clone(),
        last_name: scim.name.family_name.clone(),
        title: scim.title.clone(),
        language: first_non_empty(&[scim.preferred_language.as_str(), scim.locale.as_str()])
            .to_string(),
        is_forbidden: scim.active == Some(false),
        ..Default::default()
    };

    user.display_name = display_name_fallback(
        &scim.display_name,
        &scim.name.formatted,
        &scim.name.given_name,
        &scim.name.family_name,
        first_non_empty(&[scim.nick_name.as_str(), scim.user_name.as_str()]),
    );

    if let Some(email) = primary_or_first(&scim.emails, |e| e.primary) {
        user.email = email.value.clone();
    }
    if let Some(phone) = primary_or_first(&scim.phone_numbers, |p| p.primary) {
        user.phone = phone.value.clone();
    }
    if let Some(photo) = primary_or_first(&scim.photos, |p| p.primary) {
        user.avatar = photo.value.clone();
    }
    if let Some(address) = primary_or_first(&scim.addresses, |a| a.primary) {
        user.location = if address.formatted.is_empty() {
            format!(
                "{}, {}, {} {}",
                address.street_address, address.locality, address.region, address.postal_code
            )
            .trim_matches(|c: char| c == ',' || c == ' ')
            .to_string()
        } else {
            address.formatted.clone()
        };
        user.region = address.country.clone();
        user.address = [
            &address.street_address,
            &address.locality,
            &address.region,
            &address.postal_code,
        ]
        .into_iter()
            .filter(|part| !part.is_empty())
            .cloned()
            .collect();
    }

    if let Some(enterprise) = &scim.enterprise {
        for (key, value) in [
            ("department", &enterprise.department),
            ("organization", &enterprise.organization),
            ("employeeNumber", &enterprise.employee_number),
        ] {
            if !value.is_empty() {
                user.properties.insert(key.to_string(), value.clone());
            }
        }
    }

    user
}
