//! Strict and fuzzy recognition, entities, converters, and confidence.

use std::collections::HashSet;

use indoc::indoc;
use smol_str::SmolStr;

use hearsay::convert::{ConverterRegistry, TokenValue};
use hearsay::graph::intents_to_graph_with;
use hearsay::ini::{parse_ini, Replacements};
use hearsay::intent::{Entity, Intent, Recognition};
use hearsay::parse::parse_sentence;
use hearsay::recognize::{recognize, RecognizeOptions};
use hearsay::{intents_to_graph, Graph, GraphOptions};

fn graph_for(ini_text: &str) -> Graph {
    intents_to_graph(&parse_ini(ini_text).unwrap()).unwrap()
}

fn zero_times(mut recognitions: Vec<Recognition>) -> Vec<Recognition> {
    for recognition in &mut recognitions {
        recognition.recognize_seconds = 0.0;
    }
    recognitions
}

fn str_tokens(tokens: &[&str]) -> Vec<TokenValue> {
    tokens.iter().map(|t| TokenValue::from(*t)).collect()
}

fn smol_tokens(tokens: &[&str]) -> Vec<SmolStr> {
    tokens.iter().map(|t| SmolStr::new(*t)).collect()
}

fn stop_words(words: &[&str]) -> HashSet<SmolStr> {
    words.iter().map(|w| SmolStr::new(*w)).collect()
}

fn simple_recognition(intent_name: &str, confidence: f64, text: &str) -> Recognition {
    Recognition {
        intent: Intent { name: SmolStr::new(intent_name), confidence },
        text: text.to_string(),
        raw_text: text.to_string(),
        tokens: str_tokens(&text.split_whitespace().collect::<Vec<_>>()),
        raw_tokens: smol_tokens(&text.split_whitespace().collect::<Vec<_>>()),
        ..Recognition::default()
    }
}

// ---------------------------------------------------------------------------
// Strict
// ---------------------------------------------------------------------------

#[test]
fn strict_single_sentence() {
    let graph = graph_for(indoc! {"
        [TestIntent]
        this is a test
    "});

    let recognitions =
        zero_times(recognize("this is a test", &graph, &RecognizeOptions::strict()));
    assert_eq!(recognitions, vec![simple_recognition("TestIntent", 1.0, "this is a test")]);

    // Extra token: no strict match
    let recognitions = recognize("this is a bad test", &graph, &RecognizeOptions::strict());
    assert!(recognitions.is_empty());

    // Missing token: no strict match
    let recognitions = recognize("this is a", &graph, &RecognizeOptions::strict());
    assert!(recognitions.is_empty());

    // Empty input: no error, no result
    let recognitions = recognize("", &graph, &RecognizeOptions::strict());
    assert!(recognitions.is_empty());
}

#[test]
fn strict_multiple_intents() {
    let graph = graph_for(indoc! {"
        [TestIntent1]
        this is a test

        [TestIntent2]
        this is a test
    "});

    let recognitions =
        zero_times(recognize("this is a test", &graph, &RecognizeOptions::strict()));
    assert_eq!(recognitions.len(), 2);
    assert!(recognitions.contains(&simple_recognition("TestIntent1", 1.0, "this is a test")));
    assert!(recognitions.contains(&simple_recognition("TestIntent2", 1.0, "this is a test")));
}

#[test]
fn strict_max_paths() {
    let graph = graph_for(indoc! {"
        [TestIntent1]
        this is a test

        [TestIntent2]
        this is a test
    "});

    let options = RecognizeOptions { max_paths: Some(1), ..RecognizeOptions::strict() };
    let recognitions = recognize("this is a test", &graph, &options);
    assert_eq!(recognitions.len(), 1);
}

#[test]
fn strict_stop_words_retry() {
    let graph = graph_for(indoc! {"
        [TestIntent]
        this is a test
    "});

    // Fails without stop words
    let recognitions = recognize("this is a abcd test", &graph, &RecognizeOptions::strict());
    assert!(recognitions.is_empty());

    // Succeeds with them, at full confidence
    let options =
        RecognizeOptions { stop_words: stop_words(&["abcd"]), ..RecognizeOptions::strict() };
    let recognitions = zero_times(recognize("this is a abcd test", &graph, &options));
    assert_eq!(recognitions, vec![simple_recognition("TestIntent", 1.0, "this is a test")]);
}

#[test]
fn strict_word_transform() {
    let graph = graph_for(indoc! {"
        [TestIntent]
        this is a test
    "});

    let lower = |s: &str| s.to_lowercase();
    let options = RecognizeOptions { word_transform: Some(&lower), ..RecognizeOptions::strict() };
    let recognitions = recognize("THIS is A test", &graph, &options);
    assert_eq!(recognitions.len(), 1);
    assert_eq!(recognitions[0].intent.confidence, 1.0);
}

// ---------------------------------------------------------------------------
// Fuzzy
// ---------------------------------------------------------------------------

#[test]
fn fuzzy_single_sentence() {
    let graph = graph_for(indoc! {"
        [TestIntent]
        this is a test
    "});

    let recognitions = zero_times(recognize("this is a test", &graph, &RecognizeOptions::fuzzy()));
    assert_eq!(recognitions, vec![simple_recognition("TestIntent", 1.0, "this is a test")]);

    // Extra token costs 1 of 4
    let recognitions =
        zero_times(recognize("this is a bad test", &graph, &RecognizeOptions::fuzzy()));
    assert_eq!(
        recognitions,
        vec![simple_recognition("TestIntent", 1.0 - 1.0 / 4.0, "this is a test")]
    );

    // Missing token fails
    let recognitions = recognize("this is a", &graph, &RecognizeOptions::fuzzy());
    assert!(recognitions.is_empty());
}

#[test]
fn fuzzy_multiple_intents() {
    let graph = graph_for(indoc! {"
        [TestIntent1]
        this is a test

        [TestIntent2]
        this is a test
    "});

    let recognitions = zero_times(recognize("this is a test", &graph, &RecognizeOptions::fuzzy()));
    assert_eq!(
        recognitions,
        vec![
            simple_recognition("TestIntent1", 1.0, "this is a test"),
            simple_recognition("TestIntent2", 1.0, "this is a test"),
        ]
    );
}

#[test]
fn fuzzy_intent_filter() {
    let graph = graph_for(indoc! {"
        [TestIntent1]
        this is a test

        [TestIntent2]
        this is a test
    "});

    let filter = |name: &str| name == "TestIntent1";
    let options = RecognizeOptions { intent_filter: Some(&filter), ..RecognizeOptions::fuzzy() };
    let recognitions = zero_times(recognize("this is a test", &graph, &options));
    assert_eq!(recognitions, vec![simple_recognition("TestIntent1", 1.0, "this is a test")]);
}

#[test]
fn fuzzy_stop_words_discount() {
    let graph = graph_for(indoc! {"
        [TestIntent]
        this is a test
    "});

    // Full cost without stop words
    let recognitions = recognize("this is a abcd test", &graph, &RecognizeOptions::fuzzy());
    assert_eq!(recognitions.len(), 1);
    assert!((recognitions[0].intent.confidence - 0.75).abs() < 1e-9);

    // Marginal cost with them
    let options =
        RecognizeOptions { stop_words: stop_words(&["abcd"]), ..RecognizeOptions::fuzzy() };
    let recognitions = recognize("this is a abcd test", &graph, &options);
    assert_eq!(recognitions.len(), 1);
    assert!((recognitions[0].intent.confidence - (1.0 - 0.1 / 4.0)).abs() < 1e-9);
}

#[test]
fn fuzzy_local_and_remote_rules() {
    let graph = graph_for(indoc! {"
        [Intent1]
        rule = a test
        this is <rule>

        [Intent2]
        rule = this is
        <rule> <Intent1.rule>
    "});

    let recognitions = zero_times(recognize("this is a test", &graph, &RecognizeOptions::fuzzy()));
    assert_eq!(
        recognitions,
        vec![
            simple_recognition("Intent1", 1.0, "this is a test"),
            simple_recognition("Intent2", 1.0, "this is a test"),
        ]
    );
}

#[test]
fn fuzzy_confidence_clamps_to_zero() {
    let graph = graph_for(indoc! {"
        [A]
        a
    "});

    // One matched token, two left over: cost 2 > |raw_tokens| = 1
    let recognitions = recognize("a z z", &graph, &RecognizeOptions::fuzzy());
    assert_eq!(recognitions.len(), 1);
    assert_eq!(recognitions[0].intent.confidence, 0.0);
}

#[test]
fn custom_cost_function() {
    let graph = graph_for(indoc! {"
        [TestIntent]
        this is a test
    "});

    // Charge double for every discarded token
    fn double_cost(input: hearsay::recognize::FuzzyCostInput<'_>) -> hearsay::recognize::FuzzyCostOutput {
        let mut cost = 0.0;
        if !input.ilabel.is_empty() {
            while input.tokens.front().is_some_and(|front| front != input.ilabel) {
                input.tokens.pop_front();
                cost += 2.0;
            }
            if input.tokens.front().is_some_and(|front| front == input.ilabel) {
                input.tokens.pop_front();
            } else {
                return hearsay::recognize::FuzzyCostOutput { cost, continue_search: false };
            }
        }
        hearsay::recognize::FuzzyCostOutput { cost, continue_search: true }
    }

    let options = RecognizeOptions { cost_function: Some(&double_cost), ..RecognizeOptions::fuzzy() };
    let recognitions = recognize("this is a bad test", &graph, &options);
    assert_eq!(recognitions.len(), 1);
    assert!((recognitions[0].intent.confidence - 0.5).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[test]
fn timer_entity_offsets() {
    let graph = graph_for(indoc! {"
        [SetTimer]
        set a timer for (ten:10){minutes}
    "});

    let recognitions =
        zero_times(recognize("set a timer for ten", &graph, &RecognizeOptions::strict()));
    assert_eq!(recognitions.len(), 1);
    let recognition = &recognitions[0];

    assert_eq!(recognition.intent.name, "SetTimer");
    assert_eq!(recognition.text, "set a timer for 10");
    assert_eq!(recognition.raw_text, "set a timer for ten");
    assert_eq!(
        recognition.entities,
        vec![Entity {
            name: SmolStr::new("minutes"),
            value: TokenValue::from("10"),
            raw_value: "ten".to_string(),
            start: 16,
            end: 18,
            raw_start: 16,
            raw_end: 19,
            tokens: vec![TokenValue::from("10")],
            raw_tokens: vec![SmolStr::new("ten")],
        }]
    );
}

#[test]
fn entity_inside_optional() {
    let intents = parse_ini(indoc! {"
        [playBook]
        read me ($audio-book-name){book} in [the] [($assistant-zones){zone}]
    "})
    .unwrap();

    let mut replacements = Replacements::new();
    replacements.insert(
        SmolStr::new("$audio-book-name"),
        vec![parse_sentence("the hound of the baskervilles").unwrap()],
    );
    replacements
        .insert(SmolStr::new("$assistant-zones"), vec![parse_sentence("bedroom").unwrap()]);

    let graph =
        intents_to_graph_with(&intents, replacements, &GraphOptions::default()).unwrap();

    let recognitions = recognize(
        "read me the hound of the baskervilles in the bedroom",
        &graph,
        &RecognizeOptions::strict(),
    );
    assert_eq!(recognitions.len(), 1);

    let entities: std::collections::HashMap<_, _> =
        recognitions[0].entities.iter().map(|e| (e.name.clone(), e)).collect();
    assert_eq!(
        entities[&SmolStr::new("book")].value,
        TokenValue::from("the hound of the baskervilles")
    );
    assert_eq!(entities[&SmolStr::new("zone")].value, TokenValue::from("bedroom"));
}

#[test]
fn tagged_alternative_inside_optional_is_extracted() {
    let graph = graph_for(indoc! {"
        [ChangeDisplay]
        display [(page | layer){layout}]
    "});

    let recognitions = recognize("display page", &graph, &RecognizeOptions::strict());
    assert_eq!(recognitions.len(), 1);
    assert_eq!(recognitions[0].entities.len(), 1);
    assert_eq!(recognitions[0].entities[0].name, "layout");
    assert_eq!(recognitions[0].entities[0].value, TokenValue::from("page"));

    // The optional branch still matches without an entity
    let recognitions = recognize("display", &graph, &RecognizeOptions::strict());
    assert_eq!(recognitions.len(), 1);
    assert!(recognitions[0].entities.is_empty());
}

#[test]
fn entity_value_substitution_per_expansion() {
    let graph = graph_for(indoc! {"
        [Lights]
        turn [the] light (on:1 | off:0){state}
    "});

    for (input, expected) in
        [("turn the light on", "1"), ("turn light off", "0"), ("turn the light off", "0")]
    {
        let recognitions = recognize(input, &graph, &RecognizeOptions::strict());
        assert_eq!(recognitions.len(), 1, "no strict match for {input:?}");
        assert_eq!(recognitions[0].entities[0].value, TokenValue::from(expected));
    }
}

// ---------------------------------------------------------------------------
// Converters
// ---------------------------------------------------------------------------

#[test]
fn converters_stack_and_type_tokens() {
    let graph = graph_for(indoc! {"
        [T]
        this is a test!upper ten:10!int!square
    "});

    let mut converters = ConverterRegistry::with_defaults();
    converters.insert("square", |values, _args| {
        values
            .iter()
            .map(|value| match value {
                TokenValue::Int(i) => Ok(TokenValue::Int(i * i)),
                other => Err(format!("cannot square {other}")),
            })
            .collect()
    });

    let options =
        RecognizeOptions { converters: Some(&converters), ..RecognizeOptions::strict() };
    let recognitions = recognize("this is a test ten", &graph, &options);
    assert_eq!(recognitions.len(), 1);

    let recognition = &recognitions[0];
    assert_eq!(recognition.text, "this is a TEST 100");
    assert_eq!(
        recognition.tokens,
        vec![
            TokenValue::from("this"),
            TokenValue::from("is"),
            TokenValue::from("a"),
            TokenValue::from("TEST"),
            TokenValue::Int(100),
        ]
    );
    assert_eq!(recognition.raw_text, "this is a test ten");
}

#[test]
fn converter_typed_entity_value() {
    let graph = graph_for(indoc! {"
        [SetTimer]
        wait (ten:10){seconds!int}
    "});

    let recognitions = recognize("wait ten", &graph, &RecognizeOptions::strict());
    assert_eq!(recognitions.len(), 1);
    assert_eq!(recognitions[0].entities[0].value, TokenValue::Int(10));
}

#[test]
fn converter_arguments_pass_through() {
    let graph = graph_for(indoc! {"
        [T]
        add two:2!plus,40
    "});

    let mut converters = ConverterRegistry::with_defaults();
    converters.insert("plus", |values, args| {
        let amount: i64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
        values
            .iter()
            .map(|value| match value {
                TokenValue::Str(s) => s
                    .parse::<i64>()
                    .map(|i| TokenValue::Int(i + amount))
                    .map_err(|err| err.to_string()),
                TokenValue::Int(i) => Ok(TokenValue::Int(i + amount)),
                other => Err(format!("cannot add to {other}")),
            })
            .collect()
    });

    let options =
        RecognizeOptions { converters: Some(&converters), ..RecognizeOptions::strict() };
    let recognitions = recognize("add two", &graph, &options);
    assert_eq!(recognitions.len(), 1);
    assert_eq!(recognitions[0].tokens, vec![TokenValue::from("add"), TokenValue::Int(42)]);
    assert_eq!(recognitions[0].text, "add 42");
}

#[test]
fn unknown_converter_drops_the_candidate() {
    let graph = graph_for(indoc! {"
        [T]
        this is a test!nosuch
    "});

    let recognitions = recognize("this is a test", &graph, &RecognizeOptions::strict());
    assert!(recognitions.is_empty());
}

// ---------------------------------------------------------------------------
// Weighted multi-intent tie
// ---------------------------------------------------------------------------

#[test]
fn weighted_tie_returns_both_intents() {
    let intents = parse_ini(indoc! {"
        [TestIntent1]
        this is a test

        [TestIntent2]
        this is a test
    "})
    .unwrap();

    let graph = intents_to_graph(&intents).unwrap();

    // Exactly two selector edges whose weights sum to 1
    let selectors = graph.edges_from(graph.start_node());
    assert_eq!(selectors.len(), 2);
    let sum: f64 = selectors.iter().map(|s| s.weight.unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-9);

    let recognitions = zero_times(recognize("this is a test", &graph, &RecognizeOptions::strict()));
    assert_eq!(recognitions.len(), 2);
    let names: Vec<_> = recognitions.iter().map(|r| r.intent.name.as_str()).collect();
    assert!(names.contains(&"TestIntent1"));
    assert!(names.contains(&"TestIntent2"));
}

// ---------------------------------------------------------------------------
// Expansions recognize strictly at full confidence
// ---------------------------------------------------------------------------

#[test]
fn every_expansion_recognizes_itself() {
    let graph = graph_for(indoc! {"
        [Lights]
        turn [the] light (on | off){state}
    "});

    let expansions = [
        "turn the light on",
        "turn the light off",
        "turn light on",
        "turn light off",
    ];

    for expansion in expansions {
        let recognitions = recognize(expansion, &graph, &RecognizeOptions::strict());
        assert_eq!(recognitions.len(), 1, "no match for {expansion:?}");
        assert_eq!(recognitions[0].intent.name, "Lights");
        assert_eq!(recognitions[0].intent.confidence, 1.0);
        assert_eq!(recognitions[0].text, expansion);
    }
}

#[test]
fn json_round_trip_preserves_recognition() {
    let intents = parse_ini(indoc! {"
        [SetTimer]
        set a timer for (ten:10){minutes}
    "})
    .unwrap();

    let graph = intents_to_graph(&intents).unwrap();
    let rebuilt = Graph::from_json(&graph.to_json());

    let from_original =
        zero_times(recognize("set a timer for ten", &graph, &RecognizeOptions::strict()));
    let from_rebuilt =
        zero_times(recognize("set a timer for ten", &rebuilt, &RecognizeOptions::strict()));
    assert_eq!(from_original, from_rebuilt);
}
