//! The JSON shapes other deployments of the pipeline rely on.

use datascanner_protocol::*;
use serde_json::json;

fn scan_spec() -> serde_json::Value {
    json!({
        "scan_tag": {"scanner": "weekly", "time": "2024-05-02T08:30:00Z", "user": "admin"},
        "source": {"type": "file", "path": "/srv/share"},
        "rule": {"type": "and", "components": [{"type": "cpr"}, {"type": "regex", "expression": "x"}]},
        "configuration": {"skip_mime": ["image/*"]}
    })
}

#[test]
fn test_conversion_round_trips_unchanged() -> anyhow::Result<()> {
    let body = json!({
        "scan_spec": scan_spec(),
        "handle": {"type": "file", "source": {"type": "file", "path": "/srv/share"}, "path": "a.txt"},
        "progress": {"rule": {"type": "cpr"}, "matches": []}
    });
    let message = Message::decode(Queue::Conversions, body.to_string().as_bytes())?;
    assert_eq!(message.queue(), Queue::Conversions);
    assert_eq!(message.to_json()?, body);
    assert_eq!(message.scan_tag().map(|tag| tag.user.as_deref()), Some(Some("admin")));
    Ok(())
}

#[test]
fn test_null_representation_survives() -> anyhow::Result<()> {
    let body = json!({
        "scan_spec": scan_spec(),
        "handle": {"type": "file", "source": {"type": "file", "path": "/srv/share"}, "path": "b.bin"},
        "progress": {"rule": {"type": "cpr"}, "matches": []},
        "representations": {"text": null}
    });
    let Message::Representation(message) =
        Message::decode(Queue::Representations, body.to_string().as_bytes())?
    else {
        panic!("expected a representation");
    };
    assert_eq!(message.representations.get("text"), Some(&serde_json::Value::Null));
    Ok(())
}

#[test]
fn test_matches_report_every_fragment() -> anyhow::Result<()> {
    let body = json!({
        "scan_spec": scan_spec(),
        "handle": {"type": "file", "source": {"type": "file", "path": "/srv/share"}, "path": "c.txt"},
        "matched": false,
        "matches": [
            {"rule": {"type": "cpr"}, "matches": [{"match": "1111XXXXXX", "offset": 3}]},
            {"rule": {"type": "regex", "expression": "x"}, "matches": null}
        ]
    });
    let Message::Matches(message) = Message::decode(Queue::Matches, body.to_string().as_bytes())? else {
        panic!("expected matches");
    };
    assert!(!message.matched);
    assert_eq!(message.matches.len(), 2);
    assert!(message.matches[1].matches.is_none());
    Ok(())
}

#[test]
fn test_unknown_problem_kind_is_rejected() {
    let body = json!({"problem": "exploded", "extra": []});
    let err = Message::decode(Queue::Problems, body.to_string().as_bytes()).unwrap_err();
    assert!(matches!(err, ProtocolError::Malformed { queue: Queue::Problems, .. }));
}
