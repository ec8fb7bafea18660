use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use datascanner_engine::backends::data::DataSource;
use datascanner_engine::backends::file::FilesystemSource;
use datascanner_engine::rules::cpr::CprRule;
use datascanner_engine::rules::meta::{DummyRule, FallbackRule};
use datascanner_engine::rules::regex::RegexRule;
use datascanner_engine::rules::{evaluate, Continuation};
use datascanner_engine::{Engine, Handle, OutputType, OutputValue, Rule, SourceManager, SourceRef};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tempfile::TempDir;
use zip::write::{FileOptions, ZipWriter};

fn write_zip(path: &std::path::Path, members: &[(&str, &[u8])]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in members {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

fn regex(expression: &str) -> Rule {
    Rule::simple(RegexRule::new(expression).unwrap())
}

#[test]
fn test_zip_inside_directory() {
    let tmp = TempDir::new().unwrap();
    write_zip(&tmp.path().join("archive.zip"), &[("hello.txt", b"hi")]);
    let engine = Engine::builtin().unwrap();
    let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
    let mut sm = SourceManager::new();

    let top: Vec<Handle> = root.handles(&mut sm).unwrap().map(Result::unwrap).collect();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].relative_path(), "archive.zip");

    let archive = engine.sources.from_handle(&top[0], None).unwrap().unwrap();
    assert_eq!(archive.type_label(), "zip");
    let members: Vec<Handle> = archive.handles(&mut sm).unwrap().map(Result::unwrap).collect();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name(), "hello.txt");
    assert_eq!(members[0].follow(&mut sm).unwrap().read_all().unwrap(), b"hi");
}

#[test]
fn test_nested_chain_tears_down_innermost_first() {
    let tmp = TempDir::new().unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(b"deep inside").unwrap();
    let compressed = gz.finish().unwrap();
    write_zip(&tmp.path().join("outer.zip"), &[("notes.txt.gz", &compressed)]);

    let engine = Engine::builtin().unwrap();
    let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
    let mut sm = SourceManager::new();

    let archive = engine
        .sources
        .from_handle(&Handle::new(Arc::clone(&root), "outer.zip"), Some(&mut sm))
        .unwrap()
        .unwrap();
    let member = Arc::clone(&archive).handles(&mut sm).unwrap().next().unwrap().unwrap();
    let filtered = engine.sources.from_handle(&member, Some(&mut sm)).unwrap().unwrap();
    assert_eq!(filtered.type_label(), "gzip");
    assert_eq!(filtered.depth(), 2);

    let leaf = Arc::clone(&filtered).handles(&mut sm).unwrap().next().unwrap().unwrap();
    assert_eq!(leaf.name(), "notes.txt");
    assert_eq!(leaf.follow(&mut sm).unwrap().read_all().unwrap(), b"deep inside");

    assert_eq!(sm.teardown_order(), vec![filtered.key(), archive.key(), root.key()]);

    // The chain survives serialisation.
    let restored = engine.sources.handle_from_json(&leaf.to_json_object()).unwrap();
    assert_eq!(restored, leaf);
    sm.clear();
    assert!(sm.is_empty());
}

#[test]
fn test_and_rule_stops_on_missing_second_term() {
    let rule = Rule::and(vec![regex("cat"), regex("dog")]);
    let first = rule.split().unwrap();
    assert_eq!(*first.head(), regex("cat"));
    let found = first.run(Some(&OutputValue::Text("the cat sat".into()))).unwrap();
    assert_eq!(found, vec![json!({"offset": 4, "match": "cat"})]);

    let Continuation::Rule(rest) = first.advance(true) else {
        panic!("a matched first term must leave the second to evaluate");
    };
    assert_eq!(rest, regex("dog"));
    let second = rest.split().unwrap();
    let found = second.run(Some(&OutputValue::Text("the cat sat".into()))).unwrap();
    assert!(found.is_empty());
    assert_eq!(second.advance(false), Continuation::Decided(false));
}

#[test]
fn test_fallback_short_circuits_dummy() {
    let engine = Engine::builtin().unwrap();
    let source: SourceRef = Arc::new(DataSource::new(b"anything".to_vec(), "text/plain"));
    let mut sm = SourceManager::new();
    let resource = Handle::new(source, "file").follow(&mut sm).unwrap();

    let rule = Rule::or(vec![Rule::simple(FallbackRule), Rule::simple(DummyRule)]);
    let mut requested = Vec::new();
    let result = evaluate(&rule, |output| {
        requested.push(output);
        engine.conversions.convert(resource.as_ref(), output, None)
    })
    .unwrap();
    assert!(result.matched);
    assert_eq!(requested, vec![OutputType::Fallback]);
}

#[test]
fn test_cpr_rule_from_json_against_html() {
    let engine = Engine::builtin().unwrap();
    let rule = engine.rules.from_json(&json!({"type": "cpr"})).unwrap();
    let page = b"<html><body><p>Journal for 111111-1118.</p><p>Ugyldig: 111311-1118</p></body></html>";
    let source: SourceRef = Arc::new(DataSource::new(page.to_vec(), "text/html"));
    let mut sm = SourceManager::new();
    let resource = Handle::new(source, "file").follow(&mut sm).unwrap();

    let result = evaluate(&rule, |output| engine.conversions.convert(resource.as_ref(), output, None)).unwrap();
    assert!(result.matched);
    let matches = result.fragments[0].matches.as_ref().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["match"], "1111XXXXXX");
}

/// Every combination of outcomes reduces any rule to a verdict within as
/// many steps as it has simple rules.
#[test]
fn test_evaluation_always_terminates() {
    let trees = vec![
        Rule::and(vec![regex("a"), Rule::or(vec![regex("b"), regex("c")]), Rule::not(regex("d"))]),
        Rule::or(vec![Rule::not(Rule::and(vec![regex("a"), regex("b")])), regex("c")]),
        Rule::not(Rule::not(Rule::or(vec![regex("a"), Rule::simple(CprRule::default())]))),
    ];
    for tree in trees {
        let leaves = tree.to_json_object().to_string().matches("\"type\":\"regex\"").count()
            + tree.to_json_object().to_string().matches("\"type\":\"cpr\"").count();
        for pattern in 0u32..16 {
            let mut current = Continuation::Rule(tree.clone());
            let mut steps = 0;
            while let Continuation::Rule(rule) = current {
                let split = rule.split().unwrap();
                current = split.advance(pattern & (1 << steps) != 0);
                steps += 1;
                assert!(steps <= leaves, "{} did not terminate", tree);
            }
        }
    }
}
