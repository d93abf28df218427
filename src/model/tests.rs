use super::*;

fn user(id: &str, name: &str) -> CanonicalUser {
    CanonicalUser {
        id: id.to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_dedup_first_occurrence_wins() {
    let mut first = user("1", "alice");
    first.email = "alice@first.page".to_string();
    let mut repeat = user("1", "alice");
    repeat.email = "alice@second.page".to_string();

    let users = dedup_users(vec![first, user("2", "bob"), repeat]);

    assert_eq!(users.len(), 2);
    assert_eq!(users[0].email, "alice@first.page");
    assert_eq!(users[1].id, "2");
}

#[test]
fn test_dedup_drops_empty_id() {
    let users = dedup_users(vec![user("", "ghost"), user("7", "carol")]);
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name, "carol");
}

#[test]
fn test_dedup_by_configured_key() {
    let users = dedup_by_key(
        vec![user("", "alice"), user("9", "alice"), user("", "bob"), user("", "")],
        UserField::Name,
    );
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].id, "");
    assert_eq!(users[1].name, "bob");
}

#[test]
fn test_display_name_fallback_order() {
    assert_eq!(
        display_name_fallback("Alice A.", "Alice Anders", "Alice", "Anders", "alice"),
        "Alice A."
    );
    assert_eq!(
        display_name_fallback("", "Alice Anders", "Alice", "Anders", "alice"),
        "Alice Anders"
    );
    assert_eq!(display_name_fallback(" ", "", "Alice", "Anders", "alice"), "Alice Anders");
    assert_eq!(display_name_fallback("", "", "Alice", "", "alice"), "Alice");
    assert_eq!(display_name_fallback("", "", "", "", "alice"), "alice");
    assert_eq!(display_name_fallback("", "", "", "", ""), "");
}

#[test]
fn test_user_field_parse_accepts_both_spellings() {
    assert_eq!(UserField::parse("DisplayName"), Some(UserField::DisplayName));
    assert_eq!(UserField::parse("display_name"), Some(UserField::DisplayName));
    assert_eq!(UserField::parse("is_forbidden"), Some(UserField::IsForbidden));
    assert_eq!(UserField::parse("favouriteColour"), None);
}

#[test]
fn test_signature_ignores_unhashed_fields() {
    let fields = vec![UserField::Name, UserField::Email];
    let mut a = user("1", "alice");
    a.email = "alice@example.com".to_string();
    let mut b = a.clone();
    b.phone = "+1 555 0100".to_string();

    assert_eq!(signature(&a, &fields), signature(&b, &fields));

    b.email = "alice@example.org".to_string();
    assert_ne!(signature(&a, &fields), signature(&b, &fields));
}

#[test]
fn test_signature_is_hex_sha256() {
    let sig = signature(&user("1", "alice"), &[UserField::Name]);
    assert_eq!(sig.len(), 64);
    assert_eq!(sig, digest("alice"));
}

#[test]
fn test_default_hashed_excludes_timestamps_and_secrets() {
    let hashed = UserField::default_hashed();
    assert!(hashed.contains(&UserField::Email));
    assert!(hashed.contains(&UserField::IsForbidden));
    assert!(!hashed.contains(&UserField::CreatedTime));
    assert!(!hashed.contains(&UserField::UpdatedTime));
    assert!(!hashed.contains(&UserField::Password));
}

#[test]
fn test_set_field_and_changed_fields() {
    let mut local = user("1", "alice");
    local.set_field(UserField::Groups, "admins, staff");
    local.set_field(UserField::IsForbidden, "TRUE");
    assert_eq!(local.groups.len(), 2);
    assert!(local.is_forbidden);

    let mut fetched = local.clone();
    fetched.email = "alice@example.com".to_string();
    fetched.is_forbidden = false;

    let changed = fetched.changed_fields(&local, &UserField::default_hashed());
    assert_eq!(changed, vec![UserField::Email, UserField::IsForbidden]);

    local.apply_fields(&fetched, &changed);
    assert_eq!(local, fetched);
}

#[test]
fn test_group_drift() {
    let local = CanonicalGroup {
        name: "engineering".to_string(),
        display_name: "Engineering".to_string(),
        ..Default::default()
    };
    let mut fetched = local.clone();
    fetched.id = "42".to_string();
    assert!(!fetched.drifted_from(&local));

    fetched.display_name = "Engineering & Ops".to_string();
    assert!(fetched.drifted_from(&local));
}
