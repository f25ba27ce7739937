use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use super::*;
use crate::ListMeta;
use crate::ObjectMeta;

#[test]
fn test_update_object_and_clear() {
    let mut meta = ObjectMeta::default();
    ApiObjectVersioner.update_object(&mut meta, 42);
    assert_eq!(meta.resource_version, "42");
    assert_eq!(ApiObjectVersioner.object_resource_version(&meta).unwrap(), 42);

    ApiObjectVersioner.update_object(&mut meta, 0);
    assert!(meta.resource_version.is_empty());
    assert_eq!(ApiObjectVersioner.object_resource_version(&meta).unwrap(), 0);
}

#[test]
fn test_update_list_rejects_zero() {
    let mut meta = ListMeta::default();
    let err = ApiObjectVersioner.update_list(&mut meta, 0, "", None).unwrap_err();
    assert!(err.to_string().contains("illegal resource version from storage"));

    ApiObjectVersioner.update_list(&mut meta, 7, "tok", Some(3)).unwrap();
    assert_eq!(meta.resource_version, "7");
    assert_eq!(meta.continue_token, "tok");
    assert_eq!(meta.remaining_item_count, Some(3));
}

#[test]
fn test_prepare_object_for_storage() {
    let mut meta = ObjectMeta {
        name: "a".to_string(),
        resource_version: "5".to_string(),
        self_link: "/api/v1/pods/a".to_string(),
        ..Default::default()
    };
    ApiObjectVersioner.prepare_object_for_storage(&mut meta);
    assert!(meta.resource_version.is_empty());
    assert!(meta.self_link.is_empty());
    assert_eq!(meta.name, "a");
}

#[test]
fn test_parse_resource_version() {
    assert_eq!(ApiObjectVersioner.parse_resource_version("").unwrap(), 0);
    assert_eq!(ApiObjectVersioner.parse_resource_version("0").unwrap(), 0);
    assert_eq!(ApiObjectVersioner.parse_resource_version("123").unwrap(), 123);

    for bad in ["abc", "-1", "1.5"] {
        let err = ApiObjectVersioner.parse_resource_version(bad).unwrap_err();
        assert!(err.is_invalid(), "{bad:?}");
    }
}

#[test]
fn test_continue_token_round_trip() {
    let token = encode_continue("/registry/pods/ns/b", "/registry/pods/", 12).unwrap();
    let (key, rv) = decode_continue(&token, "/registry/pods/").unwrap();
    assert_eq!(key, "/registry/pods/ns/b");
    assert_eq!(rv, 12);
}

#[test]
fn test_encode_continue_requires_relative_key() {
    assert!(encode_continue("/registry/secrets/x", "/registry/pods/", 1).is_err());
}

fn raw_token(json: &str) -> String {
    URL_SAFE_NO_PAD.encode(json)
}

#[test]
fn test_decode_continue_rejects_bad_tokens() {
    let cases = [
        "!!not-base64!!".to_string(),
        raw_token("not json"),
        raw_token(r#"{"v":"other/v9","rv":1,"start":"a"}"#),
        raw_token(r#"{"v":"apistore/v1","rv":0,"start":"a"}"#),
        raw_token(r#"{"v":"apistore/v1","rv":1,"start":""}"#),
        raw_token(r#"{"v":"apistore/v1","rv":1,"start":"../secrets/x"}"#),
        raw_token(r#"{"v":"apistore/v1","rv":1,"start":"ns//a"}"#),
    ];
    for token in cases {
        let err = decode_continue(&token, "/registry/pods/").unwrap_err();
        assert!(err.is_invalid(), "{token:?} gave {err:?}");
    }
}
