//! Matcher: runs the rule as far as the carried representations allow.

use super::{unexpected, Stage, StageContext};
use crate::error::StageResult;
use async_trait::async_trait;
use datascanner_engine::rules::{self, Continuation};
use datascanner_engine::{Engine, OutputType, OutputValue};
use datascanner_protocol::{
    ConversionMessage, HandleMessage, MatchFragment, MatchesMessage, Message, Progress, Queue,
    RepresentationMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Matcher {
    engine: Arc<Engine>,
}

impl Matcher {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            engine: Arc::clone(ctx.engine()),
        }
    }
}

#[async_trait]
impl Stage for Matcher {
    fn name(&self) -> &'static str {
        "matcher"
    }

    fn consumes(&self) -> &'static [Queue] {
        &[Queue::Representations]
    }

    async fn process(&self, message: Message) -> StageResult<Vec<Message>> {
        let Message::Representation(representation) = message else {
            return Err(unexpected(self.name(), &message));
        };
        // Pure computation over the message, but regexes over large texts
        // are still too slow for the async workers.
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || run_matches(&engine, representation)).await?
    }
}

fn run_matches(engine: &Engine, message: RepresentationMessage) -> StageResult<Vec<Message>> {
    let rule = engine.rules.from_json(&message.progress.rule)?;

    let mut available: HashMap<OutputType, Option<OutputValue>> = HashMap::new();
    for (key, value) in &message.representations {
        let output: OutputType = key.parse()?;
        available.insert(output, output.decode(value)?);
    }

    let (continuation, fragments) = rules::run_available(rule, |output| available.get(&output).cloned())?;

    let RepresentationMessage {
        scan_spec,
        handle,
        progress,
        ..
    } = message;
    let mut matches = progress.matches;
    matches.extend(fragments.into_iter().map(|fragment| MatchFragment {
        rule: fragment.rule,
        matches: fragment.matches,
    }));

    match continuation {
        Continuation::Decided(matched) => {
            debug!(scan_tag = %scan_spec.scan_tag, matched, "Handle decided");
            let mut outputs = Vec::with_capacity(2);
            if matched {
                outputs.push(
                    HandleMessage {
                        scan_tag: scan_spec.scan_tag.clone(),
                        handle: handle.clone(),
                    }
                    .into(),
                );
            }
            outputs.insert(
                0,
                MatchesMessage {
                    scan_spec,
                    handle,
                    matched,
                    matches,
                }
                .into(),
            );
            Ok(outputs)
        }
        Continuation::Rule(rest) => {
            debug!(scan_tag = %scan_spec.scan_tag, rule = %rest, "Another conversion needed");
            Ok(vec![ConversionMessage {
                scan_spec,
                handle,
                progress: Progress {
                    rule: rest.to_json_object(),
                    matches,
                },
            }
            .into()])
        }
    }
}
