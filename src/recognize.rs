//! Recognition of token sequences against a compiled graph.
//!
//! Two search modes share the graph: strict matching enumerates paths
//! whose input labels consume the tokens exactly, and fuzzy matching runs
//! a uniform-cost search that tolerates extra tokens (discounted when they
//! are stop words). A winning path is then replayed to reconstruct the
//! intent, its entities, and a confidence score.
//!
//! Both searches use explicit work queues; each call owns its own
//! frontier, so concurrent recognizers can share one graph freely.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use itertools::Itertools;
use log::{debug, warn};
use multimap::MultiMap;
use smol_str::SmolStr;

use crate::convert::{ConverterRegistry, TokenValue, DEFAULT_CONVERTERS};
use crate::error::PathError;
use crate::graph::{
    Graph, NodeId, BEGIN_PREFIX, CONVERTED_PREFIX, CONVERT_PREFIX, END_PREFIX, INTENT_PREFIX,
};
use crate::intent::{Entity, Intent, Recognition};

/// Shared knobs for [`recognize`].
#[derive(Default)]
pub struct RecognizeOptions<'a> {
    /// Use fuzzy (minimum-cost) search instead of strict matching.
    pub fuzzy: bool,
    /// Tokens the cost function only lightly penalizes; strict matching
    /// retries with these removed when the first pass finds nothing.
    pub stop_words: HashSet<SmolStr>,
    /// Admits intents by name; `false` prunes the whole branch.
    pub intent_filter: Option<&'a dyn Fn(&str) -> bool>,
    /// Applied symmetrically to input labels and tokens when comparing
    /// (case folding).
    pub word_transform: Option<&'a dyn Fn(&str) -> String>,
    /// Replaces [`default_fuzzy_cost`].
    pub cost_function: Option<&'a CostFn>,
    /// Converters used during path replay; the built-ins when absent.
    pub converters: Option<&'a ConverterRegistry>,
    /// Cap on the number of strict paths enumerated.
    pub max_paths: Option<usize>,
}

impl RecognizeOptions<'_> {
    /// Options for fuzzy recognition with everything else defaulted.
    pub fn fuzzy() -> Self {
        RecognizeOptions { fuzzy: true, ..RecognizeOptions::default() }
    }

    /// Options for strict recognition with everything else defaulted.
    pub fn strict() -> Self {
        RecognizeOptions::default()
    }
}

fn labels_match(ilabel: &str, token: &str, transform: Option<&dyn Fn(&str) -> String>) -> bool {
    match transform {
        Some(transform) => transform(ilabel) == transform(token),
        None => ilabel == token,
    }
}

/// Recognize intents from a whitespace-tokenized sentence.
pub fn recognize(text: &str, graph: &Graph, options: &RecognizeOptions<'_>) -> Vec<Recognition> {
    let tokens: Vec<SmolStr> = text.split_whitespace().map(SmolStr::new).collect();
    recognize_tokens(&tokens, graph, options)
}

/// Recognize intents from pre-tokenized input. Returns every successfully
/// replayed candidate; no match is the empty list, not an error.
pub fn recognize_tokens(
    tokens: &[SmolStr],
    graph: &Graph,
    options: &RecognizeOptions<'_>,
) -> Vec<Recognition> {
    let started = Instant::now();
    let converters = options.converters.unwrap_or(&*DEFAULT_CONVERTERS);
    let mut recognitions = Vec::new();

    if options.fuzzy {
        let best = best_fuzzy_cost(paths_fuzzy(tokens, graph, options));
        for result in best {
            match path_to_recognition(&result.node_path, graph, Some(result.cost), converters) {
                Ok(recognition) => recognitions.push(recognition),
                Err(err) => warn!("dropping candidate path: {err}"),
            }
        }
    } else {
        let mut paths = paths_strict(tokens, graph, None, options);
        if paths.is_empty() && !options.stop_words.is_empty() {
            // Retry without stop words, but still let them match labels
            let kept: Vec<SmolStr> =
                tokens.iter().filter(|t| !options.stop_words.contains(*t)).cloned().collect();
            paths = paths_strict(&kept, graph, Some(&options.stop_words), options);
        }

        for path in paths {
            match path_to_recognition(&path, graph, None, converters) {
                Ok(recognition) => recognitions.push(recognition),
                Err(err) => warn!("dropping candidate path: {err}"),
            }
        }
    }

    let recognize_seconds = started.elapsed().as_secs_f64();
    for recognition in &mut recognitions {
        recognition.recognize_seconds = recognize_seconds;
    }

    recognitions
}

// ---------------------------------------------------------------------------
// Strict search
// ---------------------------------------------------------------------------

/// Breadth-first enumeration of paths whose input labels consume the
/// tokens exactly. With `exclude_tokens`, an input label in the set may be
/// traversed without consuming anything, which is how the stop-word retry
/// still admits grammars that spell those words out.
pub fn paths_strict(
    tokens: &[SmolStr],
    graph: &Graph,
    exclude_tokens: Option<&HashSet<SmolStr>>,
    options: &RecognizeOptions<'_>,
) -> Vec<Vec<NodeId>> {
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut paths = Vec::new();
    let initial: VecDeque<SmolStr> = tokens.iter().cloned().collect();
    let mut queue: VecDeque<(NodeId, Vec<NodeId>, VecDeque<SmolStr>)> = VecDeque::new();
    queue.push_back((graph.start_node(), Vec::new(), initial));

    while let Some((node, path, remaining)) = queue.pop_front() {
        if graph.is_final(node) && remaining.is_empty() {
            paths.push(path.clone());
            if options.max_paths.is_some_and(|max| paths.len() >= max) {
                break;
            }
        }

        'edges: for transition in graph.edges_from(node) {
            if let Some(intent_name) = transition.olabel.strip_prefix(INTENT_PREFIX) {
                if let Some(filter) = options.intent_filter {
                    if !filter(intent_name) {
                        continue 'edges;
                    }
                }
            }

            let mut next_tokens = remaining.clone();
            if !transition.ilabel.is_empty() {
                match next_tokens.front() {
                    Some(front) => {
                        if labels_match(&transition.ilabel, front, options.word_transform) {
                            next_tokens.pop_front();
                        } else if !exclude_tokens.is_some_and(|ex| ex.contains(&transition.ilabel)) {
                            // Input label mismatch
                            continue 'edges;
                        }
                    }
                    // Ran out of tokens
                    None => continue 'edges,
                }
            }

            let mut next_path = path.clone();
            next_path.push(node);
            queue.push_back((transition.target, next_path, next_tokens));
        }
    }

    paths
}

// ---------------------------------------------------------------------------
// Fuzzy search
// ---------------------------------------------------------------------------

/// One minimum-cost path for an intent.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyResult {
    pub intent_name: SmolStr,
    pub node_path: Vec<NodeId>,
    pub cost: f64,
}

/// Input to the pluggable fuzzy cost function.
pub struct FuzzyCostInput<'a> {
    pub ilabel: &'a SmolStr,
    /// Remaining input tokens; the function consumes from the front.
    pub tokens: &'a mut VecDeque<SmolStr>,
    pub stop_words: &'a HashSet<SmolStr>,
    pub word_transform: Option<&'a dyn Fn(&str) -> String>,
}

/// Output of the fuzzy cost function.
pub struct FuzzyCostOutput {
    pub cost: f64,
    pub continue_search: bool,
}

pub type CostFn = dyn Fn(FuzzyCostInput<'_>) -> FuzzyCostOutput;

/// Default cost: discard mismatched tokens from the front at 1 apiece
/// (0.1 for stop words) until the input label matches; fail the edge if it
/// never does.
pub fn default_fuzzy_cost(input: FuzzyCostInput<'_>) -> FuzzyCostOutput {
    let mut cost = 0.0;

    if !input.ilabel.is_empty() {
        while let Some(front) = input.tokens.front() {
            if labels_match(input.ilabel, front, input.word_transform) {
                break;
            }
            let bad_token = input.tokens.pop_front().unwrap();
            if input.stop_words.contains(&bad_token) {
                // Marginal cost so paths matching stop words win
                cost += 0.1;
            } else {
                cost += 1.0;
            }
        }

        let matched = input
            .tokens
            .front()
            .is_some_and(|front| labels_match(input.ilabel, front, input.word_transform));
        if matched {
            input.tokens.pop_front();
        } else {
            return FuzzyCostOutput { cost, continue_search: false };
        }
    }

    FuzzyCostOutput { cost, continue_search: true }
}

/// Uniform-cost search over the graph. Returns, per intent, every
/// minimum-cost path found for that intent.
pub fn paths_fuzzy(
    tokens: &[SmolStr],
    graph: &Graph,
    options: &RecognizeOptions<'_>,
) -> MultiMap<SmolStr, FuzzyResult> {
    let mut results: MultiMap<SmolStr, FuzzyResult> = MultiMap::new();
    if tokens.is_empty() {
        return results;
    }

    let default_cost: &CostFn = &default_fuzzy_cost;
    let cost_function = options.cost_function.unwrap_or(default_cost);

    // Lowest cost seen at any final state so far
    let mut best_cost = graph.len() as f64;

    struct Item {
        node: NodeId,
        in_tokens: VecDeque<SmolStr>,
        out_nodes: Vec<NodeId>,
        out_count: usize,
        cost: f64,
        intent: Option<SmolStr>,
    }

    let mut queue: VecDeque<Item> = VecDeque::new();
    queue.push_back(Item {
        node: graph.start_node(),
        in_tokens: tokens.iter().cloned().collect(),
        out_nodes: Vec::new(),
        out_count: 0,
        cost: 0.0,
        intent: None,
    });

    while let Some(item) = queue.pop_front() {
        // Only paths that output at least one grammar word may finalize.
        if graph.is_final(item.node) && item.cost < item.out_count as f64 {
            let intent_name = item.intent.clone().unwrap_or_default();
            // Remaining tokens count against the path
            let final_cost = item.cost + item.in_tokens.len() as f64;

            let best_intent_cost = results.get_vec(&intent_name).and_then(|v| v.first()).map(|r| r.cost);
            let result = FuzzyResult {
                intent_name: intent_name.clone(),
                node_path: item.out_nodes.clone(),
                cost: final_cost,
            };
            match best_intent_cost {
                None => results.insert(intent_name, result),
                Some(best) if final_cost < best => {
                    results.remove(&intent_name);
                    results.insert(intent_name, result);
                }
                Some(best) if final_cost == best => results.insert(intent_name, result),
                Some(_) => {}
            }

            if final_cost < best_cost {
                best_cost = final_cost;
            }
        }

        if item.cost > best_cost {
            // Can't get any better
            continue;
        }

        'edges: for transition in graph.edges_from(item.node) {
            let mut next_intent = item.intent.clone();
            let mut next_out_count = item.out_count;

            if !transition.olabel.is_empty() {
                if let Some(intent_name) = transition.olabel.strip_prefix(INTENT_PREFIX) {
                    if let Some(filter) = options.intent_filter {
                        if !filter(intent_name) {
                            continue 'edges;
                        }
                    }
                    next_intent = Some(SmolStr::new(intent_name));
                } else if !transition.olabel.starts_with("__") {
                    next_out_count += 1;
                }
            }

            let mut next_in_tokens = item.in_tokens.clone();
            let cost_output = cost_function(FuzzyCostInput {
                ilabel: &transition.ilabel,
                tokens: &mut next_in_tokens,
                stop_words: &options.stop_words,
                word_transform: options.word_transform,
            });

            if !cost_output.continue_search {
                continue 'edges;
            }

            let mut next_out_nodes = item.out_nodes.clone();
            next_out_nodes.push(item.node);

            queue.push_back(Item {
                node: transition.target,
                in_tokens: next_in_tokens,
                out_nodes: next_out_nodes,
                out_count: next_out_count,
                cost: item.cost + cost_output.cost,
                intent: next_intent,
            });
        }
    }

    results
}

/// Collapse per-intent fuzzy results by overall minimum cost, keeping
/// every tied path. Sorted by intent name for deterministic output.
pub fn best_fuzzy_cost(results: MultiMap<SmolStr, FuzzyResult>) -> Vec<FuzzyResult> {
    let mut best_cost: Option<f64> = None;
    let mut best_results: Vec<FuzzyResult> = Vec::new();

    for (_, intent_results) in results.iter_all() {
        let Some(cost) = intent_results.first().map(|r| r.cost) else {
            continue;
        };

        match best_cost {
            None => {
                best_cost = Some(cost);
                best_results = intent_results.clone();
            }
            Some(best) if cost < best => {
                best_cost = Some(cost);
                best_results = intent_results.clone();
            }
            Some(best) if cost == best => best_results.extend(intent_results.iter().cloned()),
            Some(_) => {}
        }
    }

    best_results.sort_by(|a, b| a.intent_name.cmp(&b.intent_name));
    best_results
}

// ---------------------------------------------------------------------------
// Path replay
// ---------------------------------------------------------------------------

/// One element of the replay stream: a raw/substituted token pair or an
/// entity boundary marker.
#[derive(Debug, Clone)]
enum ReplayItem {
    Pair { raw: Option<SmolStr>, sub: Option<TokenValue> },
    Begin(SmolStr),
    End(SmolStr),
}

/// An open converter region accumulating items until its end marker.
struct ConvertFrame {
    name: SmolStr,
    args: Vec<SmolStr>,
    items: Vec<ReplayItem>,
}

/// Replay a node path: apply converters, extract entities, compute texts
/// and confidence. `cost` is present for fuzzy paths.
pub fn path_to_recognition(
    node_path: &[NodeId],
    graph: &Graph,
    cost: Option<f64>,
    converters: &ConverterRegistry,
) -> Result<Recognition, PathError> {
    if node_path.is_empty() {
        return Err(PathError::inconsistent("empty path"));
    }

    let mut intent_name = SmolStr::default();
    let mut outer: Vec<ReplayItem> = Vec::new();
    let mut stack: Vec<ConvertFrame> = Vec::new();

    // Stream (word, output label) pairs through the converter stack.
    for (node, next_node) in node_path.iter().copied().tuple_windows() {
        let transition = graph
            .edge(node, next_node)
            .ok_or_else(|| PathError::inconsistent(format!("no edge {node} -> {next_node}")))?;
        let word = graph.word(next_node).filter(|w| !w.is_empty()).cloned();
        let olabel = &transition.olabel;

        if let Some(name) = olabel.strip_prefix(INTENT_PREFIX) {
            if intent_name.is_empty() {
                intent_name = SmolStr::new(name);
            }
            continue;
        }

        if let Some(payload) = olabel.strip_prefix(CONVERT_PREFIX) {
            let mut parts = payload.split(',').map(SmolStr::new);
            let name = parts.next().unwrap_or_default();
            stack.push(ConvertFrame { name, args: parts.collect(), items: Vec::new() });
            continue;
        }

        if let Some(payload) = olabel.strip_prefix(CONVERTED_PREFIX) {
            // End markers carry the same name[,arg...] payload as begins
            let name = payload.split(',').next().unwrap_or_default();
            let frame = stack
                .pop()
                .ok_or_else(|| PathError::inconsistent(format!("{name} converted without convert")))?;
            if frame.name.as_str() != name {
                return Err(PathError::inconsistent(format!(
                    "mismatched converter: expected {}, found {name}",
                    frame.name
                )));
            }

            let converted = apply_frame(frame, converters)?;
            match stack.last_mut() {
                Some(parent) => parent.items.extend(converted),
                None => outer.extend(converted),
            }
            continue;
        }

        let item = if let Some(name) = olabel.strip_prefix(BEGIN_PREFIX) {
            ReplayItem::Begin(SmolStr::new(name))
        } else if let Some(name) = olabel.strip_prefix(END_PREFIX) {
            ReplayItem::End(SmolStr::new(name))
        } else {
            let sub = (!olabel.is_empty()).then(|| TokenValue::from(olabel.clone()));
            if word.is_none() && sub.is_none() {
                continue;
            }
            ReplayItem::Pair { raw: word, sub }
        };

        match stack.last_mut() {
            Some(frame) => frame.items.push(item),
            None => outer.push(item),
        }
    }

    if let Some(frame) = stack.last() {
        return Err(PathError::inconsistent(format!("unclosed converter {}", frame.name)));
    }

    assemble_recognition(intent_name, outer, cost)
}

/// Close a converter frame: run the converter over the substituted tokens,
/// then zip the outputs back against the raw tokens (padding the shorter
/// side) while keeping entity markers in place.
fn apply_frame(
    frame: ConvertFrame,
    converters: &ConverterRegistry,
) -> Result<Vec<ReplayItem>, PathError> {
    let mut raws: Vec<SmolStr> = Vec::new();
    let mut subs: Vec<TokenValue> = Vec::new();
    for item in &frame.items {
        if let ReplayItem::Pair { raw, sub } = item {
            if let Some(raw) = raw {
                raws.push(raw.clone());
            }
            if let Some(sub) = sub {
                subs.push(sub.clone());
            }
        }
    }

    let new_subs = converters.apply(&frame.name, &frame.args, &subs)?;
    debug!("converter {} mapped {} token(s) to {}", frame.name, subs.len(), new_subs.len());

    let count = raws.len().max(new_subs.len());
    let mut pairs = (0..count).map(|i| ReplayItem::Pair {
        raw: raws.get(i).cloned(),
        sub: new_subs.get(i).cloned(),
    });

    // Reassemble: each original pair slot takes the next converted pair;
    // leftovers go at the end.
    let mut items = Vec::with_capacity(frame.items.len());
    for item in frame.items {
        match item {
            ReplayItem::Pair { .. } => {
                if let Some(pair) = pairs.next() {
                    items.push(pair);
                }
            }
            marker => items.push(marker),
        }
    }
    items.extend(pairs);

    Ok(items)
}

/// Walk the final raw/substituted stream, maintaining the entity stack and
/// the running character offsets (token length plus one joining space).
fn assemble_recognition(
    intent_name: SmolStr,
    items: Vec<ReplayItem>,
    cost: Option<f64>,
) -> Result<Recognition, PathError> {
    let mut recognition = Recognition {
        intent: Intent { name: intent_name, confidence: 1.0 },
        ..Recognition::default()
    };

    let mut sub_index: i64 = 0;
    let mut raw_index: i64 = 0;
    let mut entity_stack: Vec<Entity> = Vec::new();

    for item in items {
        match item {
            ReplayItem::Begin(name) => entity_stack.push(Entity {
                name,
                value: TokenValue::from(""),
                raw_value: String::new(),
                start: sub_index,
                end: 0,
                raw_start: raw_index,
                raw_end: 0,
                tokens: Vec::new(),
                raw_tokens: Vec::new(),
            }),
            ReplayItem::End(name) => {
                let mut entity = entity_stack
                    .pop()
                    .ok_or_else(|| PathError::inconsistent(format!("{name} ended without begin")))?;
                if entity.name != name {
                    return Err(PathError::inconsistent(format!(
                        "mismatched entity: expected {}, found {name}",
                        entity.name
                    )));
                }

                entity.end = sub_index - 1;
                entity.raw_end = raw_index - 1;
                entity.value = match entity.tokens.as_slice() {
                    [single] => single.clone(),
                    many => TokenValue::from(SmolStr::new(many.iter().join(" "))),
                };
                entity.raw_value = entity.raw_tokens.iter().join(" ");
                recognition.entities.push(entity);
            }
            ReplayItem::Pair { raw, sub } => {
                if let Some(raw) = raw {
                    raw_index += raw.chars().count() as i64 + 1;
                    if let Some(entity) = entity_stack.last_mut() {
                        entity.raw_tokens.push(raw.clone());
                    }
                    recognition.raw_tokens.push(raw);
                }
                if let Some(sub) = sub {
                    sub_index += sub.to_string().chars().count() as i64 + 1;
                    if let Some(entity) = entity_stack.last_mut() {
                        entity.tokens.push(sub.clone());
                    }
                    recognition.tokens.push(sub);
                }
            }
        }
    }

    if let Some(entity) = entity_stack.last() {
        return Err(PathError::inconsistent(format!("unterminated entity {}", entity.name)));
    }

    recognition.text = recognition.tokens.iter().join(" ");
    recognition.raw_text = recognition.raw_tokens.iter().join(" ");

    if let Some(cost) = cost {
        if cost > 0.0 {
            let token_count = recognition.raw_tokens.len().max(1) as f64;
            recognition.intent.confidence = (1.0 - cost / token_count).max(0.0);
        }
    }

    Ok(recognition)
}
