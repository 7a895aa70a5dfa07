//! Prompt text sent to the oracle.

use crate::model::{Classification, Outcome};
use serde::Serialize;

pub const EXPERT_ROLE: &str =
    "You are an expert clinical analyst specialized in assessing integrity of clinical trial data";

pub const DIFFICULTY_ROLE: &str = "Please estimate the difficulty and complexity grade of the following prompt. \
If the prompt is too long, you will only receive the beginning. Only provide a JSON string with the \
following keys: 'difficulty' enumerating options (easy, moderate, hard)";

#[derive(Serialize)]
struct RegistryOutcomeView<'a> {
    measure: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(rename = "timeFrame", skip_serializing_if = "Option::is_none")]
    time_frame: Option<&'a str>,
    is_primary: bool,
}

#[derive(Serialize)]
struct CandidateView<'a> {
    number: u32,
    name: &'a str,
    instrument: &'a str,
    is_primary: bool,
}

pub fn classification(title: &str, outcome: &Outcome) -> String {
    let view = RegistryOutcomeView {
        measure: &outcome.measure,
        description: outcome.description.as_deref(),
        time_frame: outcome.time_frame.as_deref(),
        is_primary: outcome.is_primary,
    };
    let outcome_json = serde_json::to_string(&view).unwrap_or_default();
    format!(
        "In a clinical trial, a patient-reported outcome (PRO) is any information about a patient's health \
condition that comes partially from the patient themselves, i.e. a subjective report. Below, you receive a \
JSON string of an Outcome Measure in the clinical trial '{title}'. Please respond if this outcome is PRO or \
not (partially PRO is still considered a PRO, such as ARC20), specify the instrument used if any and give the \
reason for your assessment as a JSON string with keys 'is_pro', 'reason' and 'instrument'.\n{outcome_json}"
    )
}

pub fn matching(title: &str, registry: &Classification, candidates: &[&Outcome]) -> String {
    let views: Vec<CandidateView<'_>> = candidates
        .iter()
        .map(|o| CandidateView {
            number: o.number,
            name: &o.measure,
            instrument: &o.instrument,
            is_primary: o.is_primary,
        })
        .collect();
    let candidates_json = serde_json::to_string_pretty(&views).unwrap_or_else(|_| "[]".to_string());
    let description = registry
        .outcome
        .description
        .as_deref()
        .unwrap_or("No description");
    format!(
        "Below, you receive a JSON list of Outcome Measures in the clinical trial '{title}':\n{candidates_json}\n\n\
One of the above outcomes should match with this outcome, which has been formulated differently:\n\
Measure: {measure}\nDescription: {description}\nInstrument: {instrument}\n\n\
Please indicate the best matching number (-1 if no match) in a JSON dictionary with the key 'match_number'. \
In addition, report with the boolean key 'has_changed' if the Outcome Measure is significantly different \
(measure or instrument has changed).\n",
        measure = registry.outcome.measure,
        instrument = registry.instrument,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    #[test]
    fn matching_prompt_lists_only_given_candidates() {
        let registry = Classification {
            number: 1,
            outcome: Outcome::new(1, "Quality of life", Source::Registry),
            is_pro: true,
            instrument: "SF-36".to_string(),
            reason: String::new(),
        };
        let a = Outcome::new(4, "QoL questionnaire", Source::Ethical).with_description("Patient diary");
        let prompt = matching("Trial X", &registry, &[&a]);
        assert!(prompt.contains("\"number\": 4"));
        assert!(prompt.contains("Description: No description"));
        assert!(prompt.contains("Instrument: SF-36"));
        assert!(!prompt.contains("\"source\""));
        assert!(!prompt.contains("Patient diary"));
    }
}
