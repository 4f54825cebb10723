use std::ffi::OsString;
use std::fs;

use argh::FromArgs;
use log::debug;

use hearsay::graph::{sentences_to_graph, GraphOptions};
use hearsay::ini::{parse_ini, split_rules};
use hearsay::transducer::graph_to_fst;
use hearsay::{walk_sentence, word_case_visitor, Replacements, Sentences};

#[derive(FromArgs)]
/// Compile sentence grammars into a graph
#[argh(subcommand, name = "compile")]
pub struct Compile {
    /// sentences ini file (may repeat)
    #[argh(option, short = 's')]
    sentences: Vec<OsString>,

    /// casing applied to grammar words: keep, lower, or upper
    #[argh(option, default = "String::from(\"keep\")")]
    casing: String,

    /// write transducer text instead of graph JSON
    #[argh(switch)]
    fst: bool,

    /// skip intent weighting
    #[argh(switch)]
    no_weights: bool,
}

impl Compile {
    pub fn run(self) -> Result<(), String> {
        let (sentences, replacements) = load_sentences(&self.sentences, &self.casing)?;

        let options = GraphOptions { add_intent_weights: !self.no_weights, ..GraphOptions::default() };
        let graph = sentences_to_graph(&sentences, &replacements, &options)
            .map_err(|err| err.to_string())?;
        debug!("graph has {} nodes", graph.len());

        if self.fst {
            print!("{}", graph_to_fst(&graph).fst_text);
        } else {
            let json =
                serde_json::to_string(&graph.to_json()).map_err(|err| err.to_string())?;
            println!("{json}");
        }

        Ok(())
    }
}

/// Read and parse grammar files, apply casing, and split out the rules.
pub fn load_sentences(
    paths: &[OsString],
    casing: &str,
) -> Result<(Sentences, Replacements), String> {
    if paths.is_empty() {
        return Err("at least one --sentences file is required".to_string());
    }

    let mut ini_text = String::new();
    for path in paths {
        debug!("reading {}", path.to_string_lossy());
        let text = fs::read_to_string(path)
            .map_err(|err| format!("{}: {err}", path.to_string_lossy()))?;
        ini_text.push_str(&text);
        ini_text.push('\n');
    }

    let intents = parse_ini(&ini_text).map_err(|err| err.to_string())?;
    let (mut sentences, mut replacements) = split_rules(&intents, Replacements::new());

    let transform = match casing {
        "keep" => None,
        "lower" => Some(str::to_lowercase as fn(&str) -> String),
        "upper" => Some(str::to_uppercase as fn(&str) -> String),
        other => return Err(format!("unknown casing: {other}")),
    };
    if let Some(transform) = transform {
        let mut visitor = word_case_visitor(transform);
        for intent_sentences in sentences.values_mut() {
            for sentence in intent_sentences {
                walk_sentence(sentence, &mut visitor, &mut replacements);
            }
        }
    }

    Ok((sentences, replacements))
}
