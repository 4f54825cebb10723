//! Ordered n-gram counts over the compiled graph.
//!
//! The graph is first projected down to words only: marker and epsilon
//! nodes are clipped with their predecessors reconnected to their
//! successors, and the start/final nodes become the `<s>`/`</s>` padding
//! words. Counts then come from two topological passes per intent: the
//! number of paths from `<s>` into each node and from each node out to
//! `</s>`; a node's unigram count is the product of the two, and higher
//! orders walk predecessors up to the configured order.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use log::debug;
use smol_str::SmolStr;

use crate::graph::{lcm, Graph, NodeId, INTENT_PREFIX};

/// Counts keyed by n-gram, for one intent.
pub type NgramCounts = HashMap<Vec<SmolStr>, u64>;

/// Knobs for [`get_intent_ngram_counts`].
#[derive(Debug, Clone)]
pub struct NgramOptions {
    /// Highest n-gram order to count.
    pub order: usize,
    /// Rescale each intent's counts by `LCM(sentence counts) / count` so
    /// intents with few sentences are not underrepresented.
    pub balance_counts: bool,
    pub pad_start: SmolStr,
    pub pad_end: SmolStr,
}

impl Default for NgramOptions {
    fn default() -> Self {
        NgramOptions {
            order: 3,
            balance_counts: true,
            pad_start: SmolStr::new("<s>"),
            pad_end: SmolStr::new("</s>"),
        }
    }
}

/// Words-only projection of a graph.
struct WordGraph {
    words: HashMap<NodeId, SmolStr>,
    succ: HashMap<NodeId, BTreeSet<NodeId>>,
    pred: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl WordGraph {
    fn contains(&self, node: NodeId) -> bool {
        self.words.contains_key(&node)
    }
}

/// Project the graph down to word-bearing nodes plus the padded
/// start/final nodes.
fn to_word_graph(graph: &Graph, pad_start: &SmolStr, pad_end: &SmolStr) -> WordGraph {
    let mut words: HashMap<NodeId, SmolStr> = HashMap::new();
    let mut succ: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
    let mut pred: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();

    for node in graph.node_ids() {
        if let Some(word) = graph.word(node) {
            if !word.is_empty() {
                words.insert(node, word.clone());
            }
        }
        succ.entry(node).or_default();
        pred.entry(node).or_default();
    }
    words.insert(graph.start_node(), pad_start.clone());
    words.insert(graph.final_node(), pad_end.clone());

    for node in graph.node_ids() {
        for transition in graph.edges_from(node) {
            succ.entry(node).or_default().insert(transition.target);
            pred.entry(transition.target).or_default().insert(node);
        }
    }

    // Clip meta (non-word) nodes, reconnecting around them
    for node in graph.node_ids() {
        if words.contains_key(&node) {
            continue;
        }

        let preds = pred.remove(&node).unwrap_or_default();
        let succs = succ.remove(&node).unwrap_or_default();
        for p in &preds {
            if let Some(set) = succ.get_mut(p) {
                set.remove(&node);
                set.extend(succs.iter().copied());
            }
        }
        for s in &succs {
            if let Some(set) = pred.get_mut(s) {
                set.remove(&node);
                set.extend(preds.iter().copied());
            }
        }
    }

    WordGraph { words, succ, pred }
}

/// Restriction of a word graph to one intent's nodes.
struct Subgraph<'a> {
    word_graph: &'a WordGraph,
    nodes: BTreeSet<NodeId>,
}

impl Subgraph<'_> {
    fn preds(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.word_graph
            .pred
            .get(&node)
            .into_iter()
            .flatten()
            .copied()
            .filter(|n| self.nodes.contains(n))
    }

    fn succs(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.word_graph
            .succ
            .get(&node)
            .into_iter()
            .flatten()
            .copied()
            .filter(|n| self.nodes.contains(n))
    }

    fn word(&self, node: NodeId) -> SmolStr {
        self.word_graph.words.get(&node).cloned().unwrap_or_default()
    }

    /// Kahn's algorithm over the restricted edges.
    fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: BTreeMap<NodeId, usize> =
            self.nodes.iter().map(|&n| (n, self.preds(n).count())).collect();
        let mut queue: VecDeque<NodeId> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for next in self.succs(node) {
                let degree = in_degree.get_mut(&next).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        order
    }
}

/// All nodes reachable from `root` in the original graph.
fn descendants(graph: &Graph, root: NodeId) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        for transition in graph.edges_from(node) {
            if seen.insert(transition.target) {
                stack.push(transition.target);
            }
        }
    }
    seen
}

/// N-gram counts per intent.
pub fn get_intent_ngram_counts(
    graph: &Graph,
    options: &NgramOptions,
) -> BTreeMap<SmolStr, NgramCounts> {
    assert!(options.order > 0, "order must be greater than zero");

    let word_graph = to_word_graph(graph, &options.pad_start, &options.pad_end);
    let start_node = graph.start_node();
    let end_node = graph.final_node();

    let mut intent_counts: BTreeMap<SmolStr, NgramCounts> = BTreeMap::new();
    let mut sentence_counts: BTreeMap<SmolStr, u64> = BTreeMap::new();

    for transition in graph.edges_from(start_node) {
        let Some(intent_name) = transition.olabel.strip_prefix(INTENT_PREFIX) else {
            continue;
        };
        sentence_counts.insert(SmolStr::new(intent_name), transition.sentence_count.unwrap_or(1));

        // Restrict the word graph to this intent's nodes
        let mut nodes: BTreeSet<NodeId> = descendants(graph, transition.target)
            .into_iter()
            .filter(|n| word_graph.contains(*n))
            .collect();
        nodes.insert(start_node);

        let subgraph = Subgraph { word_graph: &word_graph, nodes };
        let counts = count_ngrams(&subgraph, start_node, end_node, options.order);
        intent_counts.insert(SmolStr::new(intent_name), counts);
    }

    if options.balance_counts {
        let counts_lcm = lcm(sentence_counts.values().copied());
        for (intent_name, sentence_count) in &sentence_counts {
            let multiplier = counts_lcm / (*sentence_count).max(1);
            debug!("balancing {intent_name} ngram counts by {multiplier}");
            if let Some(counts) = intent_counts.get_mut(intent_name) {
                for count in counts.values_mut() {
                    *count *= multiplier;
                }
            }
        }
    }

    intent_counts
}

/// Count n-grams in one intent's word subgraph.
fn count_ngrams(subgraph: &Subgraph<'_>, start: NodeId, end: NodeId, order: usize) -> NgramCounts {
    // Path counts down from <s> and up to </s>
    let mut up_counts: HashMap<NodeId, u64> = HashMap::from([(start, 1)]);
    let mut down_counts: HashMap<NodeId, u64> = HashMap::from([(end, 1)]);

    let topo_order = subgraph.topological_order();
    for &node in topo_order.iter().skip(1) {
        let total: u64 = subgraph.preds(node).map(|p| up_counts.get(&p).copied().unwrap_or(0)).sum();
        *up_counts.entry(node).or_insert(0) += total;
    }
    for &node in topo_order.iter().rev().skip(1) {
        let total: u64 =
            subgraph.succs(node).map(|s| down_counts.get(&s).copied().unwrap_or(0)).sum();
        *down_counts.entry(node).or_insert(0) += total;
    }

    let mut ngram_counts = NgramCounts::new();
    for &node in &subgraph.nodes {
        let up = up_counts.get(&node).copied().unwrap_or(0);
        let down = down_counts.get(&node).copied().unwrap_or(0);

        let ngram = vec![subgraph.word(node)];
        *ngram_counts.entry(ngram.clone()).or_insert(0) += up * down;

        if order == 1 {
            continue;
        }

        // Extend backwards through predecessors up to the configured order
        let mut queue = VecDeque::from([(node, ngram)]);
        while let Some((current, current_ngram)) = queue.pop_front() {
            for prev in subgraph.preds(current) {
                let mut prev_ngram = Vec::with_capacity(current_ngram.len() + 1);
                prev_ngram.push(subgraph.word(prev));
                prev_ngram.extend(current_ngram.iter().cloned());

                let prev_up = up_counts.get(&prev).copied().unwrap_or(0);
                *ngram_counts.entry(prev_ngram.clone()).or_insert(0) += prev_up * down;

                if prev_ngram.len() < order {
                    queue.push_back((prev, prev_ngram));
                }
            }
        }
    }

    ngram_counts
}
