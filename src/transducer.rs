//! Transducer text format for external finite-state toolchains.
//!
//! Each line is `from to ilabel olabel weight`; a lone integer marks a
//! final state. Empty labels are written as `<eps>`. States are renumbered
//! from 0 in breadth-first edge order, and labels are interned into shared
//! symbol tables (`<eps>` = 0).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use smol_str::SmolStr;
use string_builder::Builder;

use crate::graph::{Graph, NodeId, Transition, INTENT_PREFIX};

pub const EPS: &str = "<eps>";

/// Whole-graph transducer text with its symbol tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFst {
    pub fst_text: String,
    pub symbols: HashMap<SmolStr, usize>,
    pub input_symbols: HashMap<SmolStr, usize>,
    pub output_symbols: HashMap<SmolStr, usize>,
}

impl GraphFst {
    /// Write the transducer text and both symbol tables to files.
    pub fn write(
        &self,
        fst_text_path: impl AsRef<Path>,
        isymbols_path: impl AsRef<Path>,
        osymbols_path: impl AsRef<Path>,
    ) -> io::Result<()> {
        std::fs::write(fst_text_path, &self.fst_text)?;
        write_symbols(&self.input_symbols, isymbols_path)?;
        write_symbols(&self.output_symbols, osymbols_path)
    }
}

/// Per-intent transducer texts sharing one set of symbol tables. The
/// intent-selector edges themselves are not included; each text is rooted
/// at its intent's entry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFsts {
    pub intent_fsts: BTreeMap<SmolStr, String>,
    pub symbols: HashMap<SmolStr, usize>,
    pub input_symbols: HashMap<SmolStr, usize>,
    pub output_symbols: HashMap<SmolStr, usize>,
}

fn write_symbols(symbols: &HashMap<SmolStr, usize>, path: impl AsRef<Path>) -> io::Result<()> {
    let mut entries: Vec<_> = symbols.iter().collect();
    entries.sort_by_key(|(_, id)| **id);

    let mut file = File::create(path)?;
    for (symbol, id) in entries {
        writeln!(file, "{symbol} {id}")?;
    }
    Ok(())
}

/// Shared interning/renumbering state for one emission pass.
#[derive(Default)]
struct SymbolTables {
    symbols: HashMap<SmolStr, usize>,
    input_symbols: HashMap<SmolStr, usize>,
    output_symbols: HashMap<SmolStr, usize>,
}

impl SymbolTables {
    fn new() -> Self {
        let mut tables = SymbolTables::default();
        tables.symbols.insert(SmolStr::new(EPS), 0);
        tables
    }

    fn intern(&mut self, ilabel: &SmolStr, olabel: &SmolStr) {
        let next = self.symbols.len();
        let isymbol = *self.symbols.entry(ilabel.clone()).or_insert(next);
        self.input_symbols.insert(ilabel.clone(), isymbol);

        let next = self.symbols.len();
        let osymbol = *self.symbols.entry(olabel.clone()).or_insert(next);
        self.output_symbols.insert(olabel.clone(), osymbol);
    }
}

/// Visit every edge reachable from `root` in breadth-first order.
fn edge_bfs(graph: &Graph, root: NodeId) -> Vec<(NodeId, &Transition)> {
    let mut order = Vec::new();
    let mut seen: HashSet<NodeId> = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);

    while let Some(node) = queue.pop_front() {
        for transition in graph.edges_from(node) {
            order.push((node, transition));
            if seen.insert(transition.target) {
                queue.push_back(transition.target);
            }
        }
    }

    order
}

/// Render the edges reachable from `root` as transducer text, renumbering
/// states from 0 and interning labels into `tables`.
fn emit_fst_text(graph: &Graph, root: NodeId, tables: &mut SymbolTables) -> String {
    let mut builder = Builder::default();
    let mut state_map: HashMap<NodeId, usize> = HashMap::new();
    let mut final_states: Vec<usize> = Vec::new();

    for (from_node, transition) in edge_bfs(graph, root) {
        let next = state_map.len();
        let from_state = *state_map.entry(from_node).or_insert(next);
        let next = state_map.len();
        let to_state = *state_map.entry(transition.target).or_insert(next);

        let ilabel = if transition.ilabel.is_empty() { SmolStr::new(EPS) } else { transition.ilabel.clone() };
        let olabel = if transition.olabel.is_empty() { SmolStr::new(EPS) } else { transition.olabel.clone() };
        tables.intern(&ilabel, &olabel);

        let weight = transition.weight.unwrap_or(0.0);
        builder.append(format!("{from_state} {to_state} {ilabel} {olabel} {weight}\n"));

        if graph.is_final(from_node) && !final_states.contains(&from_state) {
            final_states.push(from_state);
        }
        if graph.is_final(transition.target) && !final_states.contains(&to_state) {
            final_states.push(to_state);
        }
    }

    for state in final_states {
        builder.append(format!("{state}\n"));
    }

    builder.string().unwrap_or_default()
}

/// Convert the whole graph to transducer text, starting from the start
/// node so the intent-selector edges are included.
pub fn graph_to_fst(graph: &Graph) -> GraphFst {
    let mut tables = SymbolTables::new();
    let fst_text = emit_fst_text(graph, graph.start_node(), &mut tables);

    GraphFst {
        fst_text,
        symbols: tables.symbols,
        input_symbols: tables.input_symbols,
        output_symbols: tables.output_symbols,
    }
}

/// Convert the graph to one transducer text per intent.
pub fn graph_to_fsts(graph: &Graph) -> GraphFsts {
    let mut tables = SymbolTables::new();
    let mut intent_fsts = BTreeMap::new();

    for transition in graph.edges_from(graph.start_node()) {
        let Some(intent_name) = transition.olabel.strip_prefix(INTENT_PREFIX) else {
            continue;
        };
        let text = emit_fst_text(graph, transition.target, &mut tables);
        intent_fsts.insert(SmolStr::new(intent_name), text);
    }

    GraphFsts {
        intent_fsts,
        symbols: tables.symbols,
        input_symbols: tables.input_symbols,
        output_symbols: tables.output_symbols,
    }
}
