//! Directed transducer graph and the AST → graph compiler.
//!
//! Nodes get integer ids in creation order. Node 0 is the start node; a
//! single final node joins every sentence's exit. Each transition carries
//! an input label (consumed from tokens during recognition, empty =
//! epsilon), an output label (emitted to path replay, empty = none), and
//! an optional weight found only on the per-intent selector edges leaving
//! the start node.
//!
//! Marker output labels structure the paths: `__label__<intent>` selects
//! an intent, `__begin__`/`__end__` bracket tagged (entity) regions, and
//! `__convert__`/`__converted__` bracket converter regions. Both pairs
//! nest and are balanced along every path.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::CompileError;
use crate::expression::{
    resolve_rule_key, sentence_count, Expression, Sentence, Sequence, SequenceType, Tag,
    MAX_EXPANSION_DEPTH,
};
use crate::ini::{split_rules, Intents, Replacements, Sentences};

pub const INTENT_PREFIX: &str = "__label__";
pub const BEGIN_PREFIX: &str = "__begin__";
pub const END_PREFIX: &str = "__end__";
pub const CONVERT_PREFIX: &str = "__convert__";
pub const CONVERTED_PREFIX: &str = "__converted__";

pub type NodeId = usize;

/// One directed edge of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub target: NodeId,
    pub ilabel: SmolStr,
    pub olabel: SmolStr,
    /// Present only on intent-selector edges when weighting is enabled.
    pub weight: Option<f64>,
    /// Possible-sentence count for the intent; selector edges only.
    pub sentence_count: Option<u64>,
}

impl Transition {
    fn epsilon(target: NodeId) -> Self {
        Transition {
            target,
            ilabel: SmolStr::default(),
            olabel: SmolStr::default(),
            weight: None,
            sentence_count: None,
        }
    }
}

/// The compiled grammar: an immutable adjacency-list transducer.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// `word` attribute per node; present on input-consuming nodes.
    words: Vec<Option<SmolStr>>,
    /// Outgoing transitions per node.
    edges: Vec<Vec<Transition>>,
    start_node: NodeId,
    final_node: NodeId,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn start_node(&self) -> NodeId {
        self.start_node
    }

    pub fn final_node(&self) -> NodeId {
        self.final_node
    }

    pub fn is_final(&self, node: NodeId) -> bool {
        node == self.final_node
    }

    /// Word carried by an input-consuming node.
    pub fn word(&self, node: NodeId) -> Option<&SmolStr> {
        self.words.get(node).and_then(Option::as_ref)
    }

    pub fn edges_from(&self, node: NodeId) -> &[Transition] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First transition from `source` to `target`, if any.
    pub fn edge(&self, source: NodeId, target: NodeId) -> Option<&Transition> {
        self.edges_from(source).iter().find(|t| t.target == target)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.len()
    }

    fn add_node(&mut self) -> NodeId {
        self.words.push(None);
        self.edges.push(Vec::new());
        self.words.len() - 1
    }

    fn add_edge(&mut self, source: NodeId, transition: Transition) {
        self.edges[source].push(transition);
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Knobs for graph compilation.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Weight the intent-selector edges so each intent's expansions are
    /// equally likely overall; weights normalize to 1 across intents.
    pub add_intent_weights: bool,
    /// Leave slot expansions out of the per-intent sentence counts.
    pub exclude_slots_from_counts: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        GraphOptions { add_intent_weights: true, exclude_slots_from_counts: true }
    }
}

/// Compile parsed intents (sentences and rules together) into a graph.
pub fn intents_to_graph(intents: &Intents) -> Result<Graph, CompileError> {
    intents_to_graph_with(intents, Replacements::new(), &GraphOptions::default())
}

/// [`intents_to_graph`] with extra replacements (slot values, externally
/// defined rules) and explicit options.
pub fn intents_to_graph_with(
    intents: &Intents,
    replacements: Replacements,
    options: &GraphOptions,
) -> Result<Graph, CompileError> {
    let (sentences, replacements) = split_rules(intents, replacements);
    sentences_to_graph(&sentences, &replacements, options)
}

/// Compile sentences grouped by intent into a graph.
pub fn sentences_to_graph(
    sentences: &Sentences,
    replacements: &Replacements,
    options: &GraphOptions,
) -> Result<Graph, CompileError> {
    let num_intents = sentences.len();

    // Count possible sentences per intent and derive selector weights.
    let mut intent_counts: BTreeMap<SmolStr, u64> = BTreeMap::new();
    let mut intent_weights: BTreeMap<SmolStr, f64> = BTreeMap::new();
    if options.add_intent_weights {
        for (intent_name, intent_sentences) in sentences {
            let mut count: u64 = 0;
            for sentence in intent_sentences {
                count = count.saturating_add(sentence_count(
                    sentence,
                    replacements,
                    Some(intent_name.as_str()),
                    options.exclude_slots_from_counts,
                )?);
            }
            intent_counts.insert(intent_name.clone(), count.max(1));
        }

        let counts_lcm = lcm(intent_counts.values().copied());
        let raw_weights: BTreeMap<SmolStr, u64> = intent_counts
            .iter()
            .map(|(name, count)| (name.clone(), counts_lcm / (*count).max(1)))
            .collect();
        let weight_sum = raw_weights.values().sum::<u64>().max(1) as f64;
        for (name, raw) in raw_weights {
            intent_weights.insert(name, raw as f64 / weight_sum);
        }
    }

    let mut compiler = Compiler { graph: Graph::default(), replacements };
    let root_state = compiler.graph.add_node();
    compiler.graph.start_node = root_state;
    let mut final_states = Vec::new();

    for (intent_name, intent_sentences) in sentences {
        // Branch off for each intent from the start state
        let intent_state = compiler.graph.add_node();
        let mut selector = Transition {
            target: intent_state,
            ilabel: SmolStr::default(),
            olabel: SmolStr::new(format!("{INTENT_PREFIX}{intent_name}")),
            weight: None,
            sentence_count: None,
        };
        if options.add_intent_weights && num_intents > 1 {
            selector.weight = Some(intent_weights.get(intent_name).copied().unwrap_or(0.0));
            selector.sentence_count = Some(intent_counts.get(intent_name).copied().unwrap_or(1));
        }
        compiler.graph.add_edge(root_state, selector);

        for sentence in intent_sentences {
            let exit =
                compiler.emit_sentence(sentence, intent_state, false, intent_name.as_str(), 0)?;
            final_states.push(exit);
        }
    }

    // Single final state joined by every sentence exit
    let final_state = compiler.graph.add_node();
    compiler.graph.final_node = final_state;
    for state in final_states {
        compiler.graph.add_edge(state, Transition::epsilon(final_state));
    }

    debug!("compiled graph with {} nodes", compiler.graph.len());
    Ok(compiler.graph)
}

struct Compiler<'a> {
    graph: Graph,
    replacements: &'a Replacements,
}

impl Compiler<'_> {
    fn marker_edge(&mut self, source: NodeId, olabel: SmolStr) -> NodeId {
        let next = self.graph.add_node();
        self.graph.add_edge(
            source,
            Transition {
                target: next,
                ilabel: SmolStr::default(),
                olabel,
                weight: None,
                sentence_count: None,
            },
        );
        next
    }

    fn emit_sentence(
        &mut self,
        sentence: &Sentence,
        source: NodeId,
        empty_substitution: bool,
        grammar_name: &str,
        depth: usize,
    ) -> Result<NodeId, CompileError> {
        self.emit_wrapped(
            sentence.tag.as_ref(),
            sentence.substitution.as_ref(),
            &sentence.converters,
            Core::Seq(sentence),
            source,
            empty_substitution,
            grammar_name,
            depth,
        )
    }

    fn emit_expression(
        &mut self,
        expression: &Expression,
        source: NodeId,
        empty_substitution: bool,
        grammar_name: &str,
        depth: usize,
    ) -> Result<NodeId, CompileError> {
        self.emit_wrapped(
            expression.tag(),
            expression.substitution(),
            expression.converters(),
            Core::Expr(expression),
            source,
            empty_substitution,
            grammar_name,
            depth,
        )
    }

    /// Emit one node with the full marker envelope around its core:
    /// tag begin, converter begins, the subtree itself, the substitution,
    /// converter ends, tag substitution, tag end.
    #[allow(clippy::too_many_arguments)]
    fn emit_wrapped(
        &mut self,
        tag: Option<&Tag>,
        substitution: Option<&SmolStr>,
        converters: &[SmolStr],
        core: Core<'_>,
        source: NodeId,
        empty_substitution: bool,
        grammar_name: &str,
        depth: usize,
    ) -> Result<NodeId, CompileError> {
        let mut state = source;

        // A substituted subtree outputs nothing; the substitution itself is
        // emitted once, after the subtree.
        let mut empty_substitution =
            empty_substitution || substitution.is_some_and(|s| !s.is_empty());

        if let Some(tag) = tag {
            state = self.marker_edge(state, SmolStr::new(format!("{BEGIN_PREFIX}{}", tag.tag_text)));
            if tag.substitution.as_ref().is_some_and(|s| !s.is_empty()) {
                empty_substitution = true;
            }
        }

        // Converter begins: tag converters first, each list reversed so
        // that ends pair up in reverse order.
        if let Some(tag) = tag {
            for converter in tag.converters.iter().rev() {
                state = self.marker_edge(state, SmolStr::new(format!("{CONVERT_PREFIX}{converter}")));
            }
        }
        for converter in converters.iter().rev() {
            state = self.marker_edge(state, SmolStr::new(format!("{CONVERT_PREFIX}{converter}")));
        }

        state = match core {
            Core::Expr(Expression::Word(word)) => {
                let next = self.graph.add_node();
                self.graph.words[next] = Some(word.text.clone());
                let olabel = if empty_substitution {
                    SmolStr::default()
                } else {
                    word.substitution.clone().unwrap_or_else(|| word.text.clone())
                };
                self.graph.add_edge(
                    state,
                    Transition {
                        target: next,
                        ilabel: word.text.clone(),
                        olabel,
                        weight: None,
                        sentence_count: None,
                    },
                );
                next
            }
            Core::Expr(Expression::Sequence(seq)) | Core::Seq(seq) => {
                self.emit_items(seq, state, empty_substitution, grammar_name, depth)?
            }
            Core::Expr(Expression::RuleRef(rule_ref)) => {
                let replacements = self.replacements;
                let key = resolve_rule_key(rule_ref, Some(grammar_name), replacements)
                    .ok_or_else(|| CompileError::Resolve { name: rule_ref.key().to_string() })?;
                if depth >= MAX_EXPANSION_DEPTH {
                    return Err(CompileError::Recursion { name: key.to_string() });
                }

                let body = replacements
                    .get(&key)
                    .and_then(|bodies| bodies.first())
                    .ok_or_else(|| CompileError::Resolve { name: key.to_string() })?;
                self.emit_sentence(body, state, empty_substitution, grammar_name, depth + 1)?
            }
            Core::Expr(Expression::SlotRef(slot_ref)) => {
                let replacements = self.replacements;
                let key = slot_ref.key();
                let values = replacements
                    .get(&key)
                    .ok_or_else(|| CompileError::Resolve { name: key.to_string() })?;
                if depth >= MAX_EXPANSION_DEPTH {
                    return Err(CompileError::Recursion { name: key.to_string() });
                }

                // The slot's values form an alternative of sentences
                let mut exits = Vec::with_capacity(values.len());
                for value in values {
                    exits.push(self.emit_sentence(
                        value,
                        state,
                        empty_substitution,
                        grammar_name,
                        depth + 1,
                    )?);
                }
                self.join(exits)
            }
        };

        if let Some(sub) = substitution {
            if !sub.is_empty() {
                state = self.marker_edge(state, sub.clone());
            }
        }

        // Converter ends, reverse order of the begins
        for converter in converters {
            state = self.marker_edge(state, SmolStr::new(format!("{CONVERTED_PREFIX}{converter}")));
        }
        if let Some(tag) = tag {
            for converter in &tag.converters {
                state = self.marker_edge(state, SmolStr::new(format!("{CONVERTED_PREFIX}{converter}")));
            }
        }

        if let Some(tag) = tag {
            if let Some(sub) = &tag.substitution {
                if !sub.is_empty() {
                    state = self.marker_edge(state, sub.clone());
                }
            }
            state = self.marker_edge(state, SmolStr::new(format!("{END_PREFIX}{}", tag.tag_text)));
        }

        Ok(state)
    }

    /// Core emission for a sequence: thread groups, branch alternatives.
    fn emit_items(
        &mut self,
        seq: &Sequence,
        source: NodeId,
        empty_substitution: bool,
        grammar_name: &str,
        depth: usize,
    ) -> Result<NodeId, CompileError> {
        match seq.seq_type {
            SequenceType::Group => {
                let mut state = source;
                for item in &seq.items {
                    state =
                        self.emit_expression(item, state, empty_substitution, grammar_name, depth)?;
                }
                Ok(state)
            }
            SequenceType::Alternative => {
                let mut exits = Vec::with_capacity(seq.items.len());
                for item in &seq.items {
                    exits.push(self.emit_expression(
                        item,
                        source,
                        empty_substitution,
                        grammar_name,
                        depth,
                    )?);
                }
                Ok(self.join(exits))
            }
        }
    }

    /// Join branch exits through a fresh state with epsilon edges.
    fn join(&mut self, exits: Vec<NodeId>) -> NodeId {
        let merge = self.graph.add_node();
        for exit in exits {
            self.graph.add_edge(exit, Transition::epsilon(merge));
        }
        merge
    }
}

enum Core<'e> {
    Expr(&'e Expression),
    Seq(&'e Sequence),
}

/// Least common multiple; 1 for an empty iterator.
pub fn lcm(nums: impl IntoIterator<Item = u64>) -> u64 {
    let mut result: u64 = 1;
    for n in nums {
        if n == 0 {
            continue;
        }
        result = result / gcd(result, n) * n;
    }
    result
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

// ---------------------------------------------------------------------------
// JSON form
// ---------------------------------------------------------------------------

/// Node-link JSON form of a graph. Stable fields: node `id`/`start`/
/// `final`/`word`, edge `source`/`target`/`ilabel`/`olabel`/`weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphJson {
    pub nodes: Vec<NodeJson>,
    pub edges: Vec<EdgeJson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeJson {
    pub id: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub start: bool,
    #[serde(rename = "final", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeJson {
    pub source: usize,
    pub target: usize,
    pub ilabel: SmolStr,
    pub olabel: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence_count: Option<u64>,
}

impl Graph {
    /// Convert to the node-link JSON form.
    pub fn to_json(&self) -> GraphJson {
        let nodes = self
            .node_ids()
            .map(|id| NodeJson {
                id,
                start: id == self.start_node,
                is_final: id == self.final_node,
                word: self.words[id].clone(),
            })
            .collect();

        let edges = self
            .node_ids()
            .flat_map(|source| {
                self.edges_from(source).iter().map(move |t| EdgeJson {
                    source,
                    target: t.target,
                    ilabel: t.ilabel.clone(),
                    olabel: t.olabel.clone(),
                    weight: t.weight,
                    sentence_count: t.sentence_count,
                })
            })
            .collect();

        GraphJson { nodes, edges }
    }

    /// Rebuild a graph from its JSON form.
    pub fn from_json(json: &GraphJson) -> Graph {
        let len = json.nodes.iter().map(|n| n.id + 1).max().unwrap_or(0);
        let mut graph = Graph {
            words: vec![None; len],
            edges: vec![Vec::new(); len],
            start_node: 0,
            final_node: 0,
        };

        for node in &json.nodes {
            graph.words[node.id] = node.word.clone();
            if node.start {
                graph.start_node = node.id;
            }
            if node.is_final {
                graph.final_node = node.id;
            }
        }

        for edge in &json.edges {
            graph.edges[edge.source].push(Transition {
                target: edge.target,
                ilabel: edge.ilabel.clone(),
                olabel: edge.olabel.clone(),
                weight: edge.weight,
                sentence_count: edge.sentence_count,
            });
        }

        graph
    }
}
