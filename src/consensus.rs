//! Consensus engine: run N ≥ 2 orchestrated generations for the same
//! prompt and derive a single consensus value plus confidence.
//!
//! Generations run concurrently with partial-failure tolerance. Outputs
//! are compared pairwise (text or structural similarity), grouped into
//! agreements against a threshold, and resolved per the configured
//! strategy. Confidence blends the winning group's internal similarity
//! with the agreement ratio, penalized for severe disagreements.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::config::{RetryPolicy, StreamOptions};
use crate::error::{Result, StreamError};
use crate::producer::Producer;
use crate::similarity::{leaf_paths, matrix, structural_similarity, text_similarity, value_at_path};
use crate::structured::{structured, SchemaCapability};

/// How the winning output is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusStrategy {
    /// Output with the greatest weighted similarity to the others; for
    /// structured data, per-field majority assembly.
    Majority,
    /// Require near-total agreement, else downgrade per conflict policy.
    Unanimous,
    /// Majority with caller-supplied weights (weights are required).
    Weighted,
    /// Output with the highest weight, ties broken by lowest index.
    Best,
}

/// What to do when agreement falls short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Fall back to majority vote.
    Vote,
    /// Concatenate unique texts; union keys first-value-wins for data.
    Merge,
    /// Fall back to the highest-weight output.
    Best,
    /// Fail the consensus run.
    Fail,
}

/// Configuration for one consensus run.
pub struct ConsensusOptions {
    pub factories: Vec<Arc<dyn Producer>>,
    /// Switches the engine to structured mode.
    pub schema: Option<Arc<dyn SchemaCapability>>,
    /// Per-factory weights; defaults to 1.0 each.
    pub weights: Option<Vec<f64>>,
    pub strategy: ConsensusStrategy,
    pub conflict: ConflictResolution,
    /// Pairwise similarity at or above this groups two outputs. Default 0.8.
    pub similarity_threshold: f64,
    /// Minimum fraction of outputs the winning group must cover. Default 0.5.
    pub minimum_agreement: f64,
    /// Overall deadline; pending generations are abandoned at expiry.
    pub timeout: Option<Duration>,
    /// Retry policy applied to each underlying generation.
    pub retry: RetryPolicy,
}

impl ConsensusOptions {
    pub fn new(factories: Vec<Arc<dyn Producer>>) -> Self {
        Self {
            factories,
            schema: None,
            weights: None,
            strategy: ConsensusStrategy::Majority,
            conflict: ConflictResolution::Vote,
            similarity_threshold: 0.8,
            minimum_agreement: 0.5,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn schema(mut self, schema: Arc<dyn SchemaCapability>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn strategy(mut self, strategy: ConsensusStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn conflict(mut self, conflict: ConflictResolution) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn minimum_agreement(mut self, minimum: f64) -> Self {
        self.minimum_agreement = minimum;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One generation's result.
#[derive(Debug, Clone)]
pub struct ConsensusOutput {
    pub index: usize,
    pub text: String,
    pub data: Option<Value>,
    /// `None` on success, the failure message otherwise.
    pub error: Option<String>,
    pub duration_ms: u64,
    pub weight: f64,
}

impl ConsensusOutput {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A group of outputs agreeing above the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    /// Output indices in the group.
    pub indices: Vec<usize>,
    /// True when every pair in the group is identical.
    pub exact: bool,
    /// Average pairwise similarity within the group.
    pub similarity: f64,
}

/// Agreement on one leaf path of structured outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAgreement {
    pub path: String,
    pub value: Value,
    pub indices: Vec<usize>,
    /// Fraction of successful outputs sharing the value.
    pub ratio: f64,
}

/// Severity of a disagreement, from the majority ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisagreementSeverity {
    Minor,
    Moderate,
    Major,
    Critical,
}

impl DisagreementSeverity {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.8 {
            DisagreementSeverity::Minor
        } else if ratio >= 0.6 {
            DisagreementSeverity::Moderate
        } else if ratio >= 0.4 {
            DisagreementSeverity::Major
        } else {
            DisagreementSeverity::Critical
        }
    }

    fn is_severe(&self) -> bool {
        matches!(
            self,
            DisagreementSeverity::Major | DisagreementSeverity::Critical
        )
    }
}

/// A group of outputs diverging from the majority.
#[derive(Debug, Clone, PartialEq)]
pub struct Disagreement {
    pub indices: Vec<usize>,
    pub severity: DisagreementSeverity,
    /// Set for structured field-level disagreements.
    pub path: Option<String>,
}

/// The resolved consensus.
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub text: String,
    pub data: Option<Value>,
    pub confidence: f64,
    pub outputs: Vec<ConsensusOutput>,
    pub agreements: Vec<Agreement>,
    pub field_agreements: Vec<FieldAgreement>,
    pub disagreements: Vec<Disagreement>,
    /// Size of the largest identical-output group.
    pub identical_outputs: usize,
    /// Average pairwise similarity across all successful outputs.
    pub average_similarity: f64,
}

/// Run the consensus procedure.
pub async fn consensus(options: ConsensusOptions) -> Result<ConsensusResult> {
    if options.factories.len() < 2 {
        return Err(StreamError::Other(
            "consensus requires at least 2 stream factories".into(),
        ));
    }
    if let Some(weights) = &options.weights {
        if weights.len() != options.factories.len() {
            return Err(StreamError::Other(format!(
                "got {} weights for {} factories",
                weights.len(),
                options.factories.len()
            )));
        }
    }
    if options.strategy == ConsensusStrategy::Weighted && options.weights.is_none() {
        return Err(StreamError::Other(
            "weighted strategy requires weights".into(),
        ));
    }

    let weights: Vec<f64> = options
        .weights
        .clone()
        .unwrap_or_else(|| vec![1.0; options.factories.len()]);

    // 1. Execute all generations concurrently, tolerating partial failure.
    let runs = options.factories.iter().enumerate().map(|(index, factory)| {
        let factory = factory.clone();
        let schema = options.schema.clone();
        let retry = options.retry.clone();
        let weight = weights[index];
        async move {
            let started = Instant::now();
            let session_options = StreamOptions::builder(factory).retry(retry).build();
            let (text, data, error) = match schema {
                Some(schema) => match structured(session_options, schema).await {
                    Ok(outcome) => {
                        (outcome.session.content.clone(), Some(outcome.value), None)
                    }
                    Err(report) => (String::new(), None, Some(report.to_string())),
                },
                None => match crate::orchestrator::stream(session_options).finish().await {
                    Ok(outcome) => (outcome.content, None, None),
                    Err(report) => (String::new(), None, Some(report.to_string())),
                },
            };
            ConsensusOutput {
                index,
                text,
                data,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
                weight,
            }
        }
    });
    let gather = futures::future::join_all(runs);

    let outputs: Vec<ConsensusOutput> = match options.timeout {
        Some(limit) => match tokio::time::timeout(limit, gather).await {
            Ok(outputs) => outputs,
            Err(_) => return Err(StreamError::ConsensusTimeout(limit)),
        },
        None => gather.await,
    };

    // 2-3. Successful outputs only; all failing is terminal.
    let successes: Vec<&ConsensusOutput> = outputs.iter().filter(|o| o.succeeded()).collect();
    if successes.is_empty() {
        return Err(StreamError::AllStreamsFailed(outputs.len()));
    }

    let structured_mode = options.schema.is_some();

    // 4. Pairwise similarity matrix.
    let sims = matrix(&successes, |a, b| {
        if structured_mode {
            match (&a.data, &b.data) {
                (Some(da), Some(db)) => structural_similarity(da, db),
                _ => 0.0,
            }
        } else {
            text_similarity(&a.text, &b.text)
        }
    });
    let n = successes.len();
    let average_similarity = if n < 2 {
        1.0
    } else {
        let mut sum = 0.0;
        let mut pairs = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                sum += sims[i][j];
                pairs += 1;
            }
        }
        sum / pairs as f64
    };

    // 5. Agreement groups (greedy, threshold-driven).
    let mut grouped = vec![false; n];
    let mut agreements: Vec<Agreement> = Vec::new();
    for i in 0..n {
        if grouped[i] {
            continue;
        }
        let mut members = vec![i];
        grouped[i] = true;
        for j in (i + 1)..n {
            if !grouped[j] && sims[i][j] >= options.similarity_threshold {
                members.push(j);
                grouped[j] = true;
            }
        }
        let (exact, group_sim) = group_stats(&members, &sims, &successes, structured_mode);
        agreements.push(Agreement {
            indices: members.iter().map(|&m| successes[m].index).collect(),
            exact,
            similarity: group_sim,
        });
    }
    agreements.sort_by(|a, b| b.indices.len().cmp(&a.indices.len()));

    let winning_size = agreements.first().map(|a| a.indices.len()).unwrap_or(0);
    let agreement_ratio = winning_size as f64 / n as f64;

    let identical_outputs = largest_identical_group(&successes, structured_mode);

    // 5b. Field agreements for structured data.
    let field_agreements = if structured_mode {
        field_agreement_table(&successes)
    } else {
        Vec::new()
    };

    // 6. Disagreements: the complementary groups.
    let mut disagreements: Vec<Disagreement> = Vec::new();
    for agreement in agreements.iter().skip(1) {
        disagreements.push(Disagreement {
            indices: agreement.indices.clone(),
            severity: DisagreementSeverity::from_ratio(agreement_ratio),
            path: None,
        });
    }
    if structured_mode {
        for field in &field_agreements {
            if field.ratio < options.similarity_threshold && field.ratio < 1.0 {
                disagreements.push(Disagreement {
                    indices: field.indices.clone(),
                    severity: DisagreementSeverity::from_ratio(field.ratio),
                    path: Some(field.path.clone()),
                });
            }
        }
    }

    // 7-8. Enforce minimum agreement and resolve. Both the unmet-minimum
    // and failed-unanimity cases downgrade through the conflict policy.
    let mut strategy = options.strategy;
    let mut merge_instead = false;

    if agreement_ratio < options.minimum_agreement {
        match options.conflict {
            ConflictResolution::Fail => {
                return Err(StreamError::Other(format!(
                    "agreement {agreement_ratio:.2} below minimum {:.2}",
                    options.minimum_agreement
                )));
            }
            ConflictResolution::Vote => strategy = ConsensusStrategy::Majority,
            ConflictResolution::Best => strategy = ConsensusStrategy::Best,
            ConflictResolution::Merge => merge_instead = true,
        }
    }

    if strategy == ConsensusStrategy::Unanimous && average_similarity < 0.95 {
        match options.conflict {
            ConflictResolution::Fail => {
                return Err(StreamError::Other(format!(
                    "unanimity required but average similarity is {average_similarity:.2}"
                )));
            }
            ConflictResolution::Vote => strategy = ConsensusStrategy::Majority,
            ConflictResolution::Best => strategy = ConsensusStrategy::Best,
            ConflictResolution::Merge => merge_instead = true,
        }
    }

    if merge_instead {
        let (text, data) = merge_outputs(&successes, structured_mode);
        let confidence = confidence_score(
            &agreements,
            agreement_ratio,
            average_similarity,
            &disagreements,
        );
        return Ok(finish(
            text,
            data,
            confidence,
            outputs.clone(),
            agreements,
            field_agreements,
            disagreements,
            identical_outputs,
            average_similarity,
        ));
    }

    let (text, data) = match strategy {
        ConsensusStrategy::Best => {
            let winner = successes
                .iter()
                .max_by(|a, b| {
                    a.weight
                        .partial_cmp(&b.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.index.cmp(&a.index))
                })
                .expect("at least one success");
            (winner.text.clone(), winner.data.clone())
        }
        ConsensusStrategy::Majority | ConsensusStrategy::Weighted | ConsensusStrategy::Unanimous => {
            if structured_mode {
                let data = assemble_majority(&field_agreements);
                let winner = weighted_winner(&successes, &sims);
                (winner.text.clone(), Some(data))
            } else {
                let winner = weighted_winner(&successes, &sims);
                (winner.text.clone(), None)
            }
        }
    };

    let confidence = confidence_score(
        &agreements,
        agreement_ratio,
        average_similarity,
        &disagreements,
    );

    Ok(finish(
        text,
        data,
        confidence,
        outputs.clone(),
        agreements,
        field_agreements,
        disagreements,
        identical_outputs,
        average_similarity,
    ))
}

#[allow(clippy::too_many_arguments)]
fn finish(
    text: String,
    data: Option<Value>,
    confidence: f64,
    outputs: Vec<ConsensusOutput>,
    agreements: Vec<Agreement>,
    field_agreements: Vec<FieldAgreement>,
    disagreements: Vec<Disagreement>,
    identical_outputs: usize,
    average_similarity: f64,
) -> ConsensusResult {
    ConsensusResult {
        text,
        data,
        confidence,
        outputs,
        agreements,
        field_agreements,
        disagreements,
        identical_outputs,
        average_similarity,
    }
}

fn group_stats(
    members: &[usize],
    sims: &[Vec<f64>],
    successes: &[&ConsensusOutput],
    structured_mode: bool,
) -> (bool, f64) {
    if members.len() < 2 {
        // A singleton's cohesion is its average similarity to the rest.
        let i = members[0];
        let others: Vec<f64> = (0..sims.len()).filter(|&j| j != i).map(|j| sims[i][j]).collect();
        let avg = if others.is_empty() {
            1.0
        } else {
            others.iter().sum::<f64>() / others.len() as f64
        };
        return (true, avg);
    }

    let mut sum = 0.0;
    let mut pairs = 0usize;
    let mut exact = true;
    for (a, &i) in members.iter().enumerate() {
        for &j in &members[a + 1..] {
            sum += sims[i][j];
            pairs += 1;
            let same = if structured_mode {
                successes[i].data == successes[j].data
            } else {
                text_similarity(&successes[i].text, &successes[j].text) == 1.0
            };
            exact &= same;
        }
    }
    (exact, sum / pairs as f64)
}

fn largest_identical_group(successes: &[&ConsensusOutput], structured_mode: bool) -> usize {
    let mut best = 0usize;
    for a in successes {
        let count = successes
            .iter()
            .filter(|b| {
                if structured_mode {
                    a.data == b.data
                } else {
                    text_similarity(&a.text, &b.text) == 1.0
                }
            })
            .count();
        best = best.max(count);
    }
    best
}

fn field_agreement_table(successes: &[&ConsensusOutput]) -> Vec<FieldAgreement> {
    let mut paths: Vec<String> = Vec::new();
    for output in successes {
        if let Some(data) = &output.data {
            for path in leaf_paths(data) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
    }

    let mut table = Vec::new();
    for path in paths {
        // Group outputs by the value they hold at this path.
        let mut groups: Vec<(Value, Vec<usize>)> = Vec::new();
        for output in successes {
            let value = output
                .data
                .as_ref()
                .and_then(|d| value_at_path(d, &path))
                .cloned()
                .unwrap_or(Value::Null);
            match groups.iter_mut().find(|(v, _)| *v == value) {
                Some((_, indices)) => indices.push(output.index),
                None => groups.push((value, vec![output.index])),
            }
        }
        groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        let (value, indices) = groups.remove(0);
        table.push(FieldAgreement {
            ratio: indices.len() as f64 / successes.len() as f64,
            path,
            value,
            indices,
        });
    }
    table
}

fn weighted_winner<'a>(
    successes: &'a [&'a ConsensusOutput],
    sims: &[Vec<f64>],
) -> &'a ConsensusOutput {
    let mut best = 0usize;
    let mut best_score = f64::NEG_INFINITY;
    for (i, _) in successes.iter().enumerate() {
        let score: f64 = (0..successes.len())
            .filter(|&j| j != i)
            .map(|j| sims[i][j] * successes[j].weight)
            .sum();
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    successes[best]
}

fn assemble_majority(fields: &[FieldAgreement]) -> Value {
    let mut root = Value::Object(Map::new());
    for field in fields {
        insert_at_path(&mut root, &field.path, field.value.clone());
    }
    root
}

fn insert_at_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (position, segment) in segments.iter().enumerate() {
        let last = position == segments.len() - 1;
        match segment.parse::<usize>() {
            Ok(index) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let items = current.as_array_mut().expect("just coerced to array");
                while items.len() <= index {
                    items.push(Value::Null);
                }
                if last {
                    items[index] = value;
                    return;
                }
                current = &mut items[index];
            }
            Err(_) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                let map = current.as_object_mut().expect("just coerced to object");
                if last {
                    map.insert(segment.to_string(), value);
                    return;
                }
                current = map.entry(segment.to_string()).or_insert(Value::Null);
            }
        }
    }
}

fn merge_outputs(successes: &[&ConsensusOutput], structured_mode: bool) -> (String, Option<Value>) {
    let mut texts: Vec<&str> = Vec::new();
    for output in successes {
        if !texts.contains(&output.text.as_str()) {
            texts.push(&output.text);
        }
    }
    let text = texts.join("\n");

    if !structured_mode {
        return (text, None);
    }

    // Union of top-level keys, first value wins.
    let mut merged = Map::new();
    for output in successes {
        if let Some(Value::Object(map)) = &output.data {
            for (key, value) in map {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    (text, Some(Value::Object(merged)))
}

fn confidence_score(
    agreements: &[Agreement],
    agreement_ratio: f64,
    average_similarity: f64,
    disagreements: &[Disagreement],
) -> f64 {
    // Start from the winning group's cohesion, blend with the agreement
    // ratio, penalize severe disagreements, reward clean unanimity.
    let group_similarity = agreements.first().map(|a| a.similarity).unwrap_or(0.0);
    let mut confidence = (group_similarity + agreement_ratio) / 2.0;

    for disagreement in disagreements {
        if disagreement.severity.is_severe() {
            confidence -= 0.1;
        }
    }
    if agreement_ratio == 1.0 && average_similarity > 0.95 {
        confidence += 0.1;
    }
    confidence.clamp(0.0, 1.0)
}
