//! Compile spoken-command grammars into a weighted transducer graph and
//! recognize utterances against it.
//!
//! The pipeline: INI text → [`ini::parse_ini`] → per-intent sentence
//! templates → [`graph::intents_to_graph`] → one directed graph with
//! weighted per-intent branches → [`recognize::recognize`] → intents with
//! extracted entities and a confidence score.
//!
//! A grammar is INI-shaped, with a JSGF-like template language inside:
//!
//! ```ini
//! [SetTimer]
//! duration = (ten:10 | twenty:20){minutes}
//! set [a] timer for <duration>
//! ```
//!
//! `(a | b)` alternates, `[x]` is optional, `word:sub` substitutes output
//! text, `{name}` tags an entity, `!converter` post-processes matched
//! tokens, and `<rule>` / `$slot` reference shared fragments.
//!
//! The compiled [`graph::Graph`] is immutable; recognizers own their work
//! queues, so any number of them may share one graph.

pub mod convert;
pub mod error;
pub mod expression;
pub mod graph;
pub mod ini;
pub mod intent;
pub mod ngram;
pub mod parse;
pub mod recognize;
pub mod transducer;

pub use convert::{ConverterRegistry, TokenValue};
pub use error::{CompileError, PathError};
pub use expression::{
    expression_count, sentence_count, walk_expression, walk_sentence, word_case_visitor,
    Expression, RuleReference, Sentence, Sequence, SequenceType, SlotReference, Tag, WalkControl,
    Word,
};
pub use graph::{intents_to_graph, intents_to_graph_with, sentences_to_graph, Graph, GraphOptions};
pub use ini::{
    get_intent_counts, intents_to_ini, parse_ini, parse_ini_with, split_rules, IntentItem, Intents,
    ParseOptions, Replacements, Rule, Sentences,
};
pub use intent::{Entity, Intent, Recognition};
pub use parse::parse_sentence;
pub use recognize::{recognize, recognize_tokens, RecognizeOptions};
