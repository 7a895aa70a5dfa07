//! The two questions the pipeline asks the oracle.

use super::client::Backend;
use super::models::Tier;
use super::router::{AskOptions, Router};
use crate::model::{Classification, Outcome};
use crate::parse::{parse_classification, parse_match, ClassificationVerdict, MatchVerdict};
use crate::prompts;

/// Outcome-level questions, behind a trait so the reconciliation engine can
/// be driven by a scripted oracle in tests.
#[allow(async_fn_in_trait)]
pub trait OutcomeOracle {
    /// Is this registry outcome patient-reported, and with which instrument?
    async fn classify(&self, title: &str, outcome: &Outcome) -> anyhow::Result<ClassificationVerdict>;

    /// Which of `candidates` best matches `registry`, and did it change?
    async fn pick_match(
        &self,
        title: &str,
        registry: &Classification,
        candidates: &[&Outcome],
    ) -> anyhow::Result<MatchVerdict>;
}

/// [`OutcomeOracle`] answered through the tiered router.
pub struct RoutedOracle<B> {
    router: Router<B>,
    /// Tier every outcome question starts on; `None` lets the router grade difficulty.
    tier: Option<Tier>,
    system_role: String,
}

impl<B: Backend> RoutedOracle<B> {
    pub fn new(router: Router<B>, tier: Option<Tier>, system_role: impl Into<String>) -> Self {
        Self {
            router,
            tier,
            system_role: system_role.into(),
        }
    }

    async fn ask_json(&self, prompt: &str) -> anyhow::Result<String> {
        let options = AskOptions {
            system_role: Some(&self.system_role),
            tier: self.tier,
            json_mode: true,
        };
        Ok(self.router.ask(prompt, options).await?)
    }
}

impl<B: Backend> OutcomeOracle for RoutedOracle<B> {
    async fn classify(&self, title: &str, outcome: &Outcome) -> anyhow::Result<ClassificationVerdict> {
        let response = self.ask_json(&prompts::classification(title, outcome)).await?;
        parse_classification(&response)
    }

    async fn pick_match(
        &self,
        title: &str,
        registry: &Classification,
        candidates: &[&Outcome],
    ) -> anyhow::Result<MatchVerdict> {
        let response = self
            .ask_json(&prompts::matching(title, registry, candidates))
            .await?;
        parse_match(&response)
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    /// Answers from queues and remembers what it was asked.
    #[derive(Default)]
    pub(crate) struct ScriptedOracle {
        classifications: RefCell<VecDeque<anyhow::Result<ClassificationVerdict>>>,
        matches: RefCell<VecDeque<anyhow::Result<MatchVerdict>>>,
        pub classify_calls: Cell<usize>,
        /// Candidate ordinals offered on each matching call.
        pub offered: RefCell<Vec<Vec<u32>>>,
    }

    impl ScriptedOracle {
        pub fn classify_as(self, is_pro: bool, instrument: &str) -> Self {
            self.classifications.borrow_mut().push_back(Ok(ClassificationVerdict {
                is_pro,
                instrument: instrument.to_string(),
                reason: "scripted".to_string(),
            }));
            self
        }

        pub fn match_to(self, match_number: i64, has_changed: bool) -> Self {
            self.matches.borrow_mut().push_back(Ok(MatchVerdict {
                match_number,
                has_changed,
            }));
            self
        }

        pub fn fail_match(self, message: &str) -> Self {
            self.matches
                .borrow_mut()
                .push_back(Err(anyhow::anyhow!(message.to_string())));
            self
        }

        pub fn match_calls(&self) -> usize {
            self.offered.borrow().len()
        }
    }

    impl OutcomeOracle for ScriptedOracle {
        async fn classify(&self, _title: &str, _outcome: &Outcome) -> anyhow::Result<ClassificationVerdict> {
            self.classify_calls.set(self.classify_calls.get() + 1);
            self.classifications
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted classification left")))
        }

        async fn pick_match(
            &self,
            _title: &str,
            _registry: &Classification,
            candidates: &[&Outcome],
        ) -> anyhow::Result<MatchVerdict> {
            self.offered
                .borrow_mut()
                .push(candidates.iter().map(|o| o.number).collect());
            self.matches
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted match left")))
        }
    }
}
