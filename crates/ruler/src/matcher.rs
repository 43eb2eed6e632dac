/*!
Обход скомпилированной машины по развёрнутому событию.

Обход ведётся явной очередью шагов; шаг — это пара «индекс поля,
состояние имени» плюс множество живых кандидатов-под-правил и
накопленная принадлежность массивам. Ветвь продолжается, только пока
пересечение кандидатов с под-правилами сработавшего шаблона непусто;
имена правил испускаются на терминальных записях. Шаги дедуплицируются,
так что wildcard-ветвление не раздувает обход.
*/

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    rc::Rc,
};

use crate::{
    event::{ArrayMembership, Event},
    machine::Machine,
    namestate::{NameStateId, START_STATE, SubRuleId},
    pattern::Pattern,
};

struct Step {
    field: usize,
    state: NameStateId,
    // Sorted; empty means "not yet constrained".
    candidates: Rc<Vec<SubRuleId>>,
    membership: ArrayMembership,
}

type SeenKey = (usize, NameStateId, Vec<SubRuleId>, ArrayMembership);

/// Возвращает имена правил, которым удовлетворяет событие, без
/// повторов, в порядке возрастания.
pub(crate) fn rules_for_event(
    machine: &Machine,
    event: &Event,
    array_consistent: bool,
) -> Vec<String> {
    let fields = event.fields();
    let mut found: BTreeSet<SubRuleId> = BTreeSet::new();
    let mut seen: HashSet<SeenKey> = HashSet::new();
    let mut queue: VecDeque<Step> = VecDeque::new();
    let mut firings: Vec<(NameStateId, Pattern)> = vec![];

    enqueue(
        Step {
            field: 0,
            state: START_STATE,
            candidates: Rc::new(vec![]),
            membership: ArrayMembership::default(),
        },
        &mut seen,
        &mut queue,
    );

    while let Some(step) = queue.pop_front() {
        let state = machine.name(step.state);

        // Absence matchers are consulted at every step, including the
        // one past the last field, so a trailing {"exists": false} is
        // still honored.
        for (absent_key, &next) in &state.absences {
            let queried = if array_consistent {
                Some(&step.membership)
            } else {
                None
            };
            if event.has_field(absent_key, queried) {
                continue;
            }
            follow(
                machine,
                next,
                &Pattern::Absent,
                &step,
                step.field,
                step.membership.clone(),
                &mut found,
                &mut seen,
                &mut queue,
            );
        }

        if step.field >= fields.len() {
            continue;
        }
        let field = &fields[step.field];

        // The machine may ignore event fields no rule mentions.
        enqueue(
            Step {
                field: step.field + 1,
                state: step.state,
                candidates: Rc::clone(&step.candidates),
                membership: step.membership.clone(),
            },
            &mut seen,
            &mut queue,
        );

        let merged = if array_consistent {
            match step.membership.merged(field.membership()) {
                Some(merged) => merged,
                // The field crosses a sibling element of an array this
                // path already committed to.
                None => continue,
            }
        } else {
            ArrayMembership::default()
        };

        let Some(value_matcher) = state.values.get(field.path()) else {
            continue;
        };
        firings.clear();
        value_matcher.transition_on(field.value(), &mut firings);
        for (next, pattern) in firings.drain(..) {
            follow(
                machine,
                next,
                &pattern,
                &step,
                step.field + 1,
                merged.clone(),
                &mut found,
                &mut seen,
                &mut queue,
            );
        }
    }

    let names: BTreeSet<String> = found
        .iter()
        .map(|sub| machine.rule_name_of(sub.rule).to_string())
        .collect();
    names.into_iter().collect()
}

// One pattern firing: emit completed sub-rules, narrow the candidate
// set, and push the continuation step.
#[allow(clippy::too_many_arguments)]
fn follow(
    machine: &Machine,
    next: NameStateId,
    pattern: &Pattern,
    step: &Step,
    next_field: usize,
    membership: ArrayMembership,
    found: &mut BTreeSet<SubRuleId>,
    seen: &mut HashSet<SeenKey>,
    queue: &mut VecDeque<Step>,
) {
    let target = machine.name(next);
    let seeded = !step.candidates.is_empty();
    if let Some(terminal) = target.terminal.get(pattern) {
        for &sub in terminal {
            if !seeded || step.candidates.binary_search(&sub).is_ok() {
                found.insert(sub);
            }
        }
    }
    let candidates: Vec<SubRuleId> = match target.non_terminal.get(pattern) {
        None => vec![],
        // The first firing seeds the candidate set; later firings
        // intersect. Without the seeding the very first step would
        // always come up empty.
        Some(set) if !seeded => set.iter().copied().collect(),
        Some(set) => set
            .iter()
            .copied()
            .filter(|sub| step.candidates.binary_search(sub).is_ok())
            .collect(),
    };
    if candidates.is_empty() {
        return;
    }
    enqueue(
        Step {
            field: next_field,
            state: next,
            candidates: Rc::new(candidates),
            membership,
        },
        seen,
        queue,
    );
}

fn enqueue(
    step: Step,
    seen: &mut HashSet<SeenKey>,
    queue: &mut VecDeque<Step>,
) {
    let key = (
        step.field,
        step.state,
        (*step.candidates).clone(),
        step.membership.clone(),
    );
    if seen.insert(key) {
        queue.push_back(step);
    }
}

#[cfg(test)]
mod tests {
    use crate::machine::Machine;

    fn names(machine: &Machine, event: &str) -> Vec<String> {
        machine.rules_for_json_event(event).unwrap()
    }

    #[test]
    fn numeric_range_scenario() {
        let mut machine = Machine::new();
        machine
            .add_rule("r", r#"{"x": [{"numeric": [">", 0, "<=", 5]}]}"#)
            .unwrap();
        assert!(names(&machine, r#"{"x": 0}"#).is_empty());
        assert_eq!(names(&machine, r#"{"x": 3}"#), vec!["r".to_string()]);
        assert_eq!(names(&machine, r#"{"x": 5}"#), vec!["r".to_string()]);
        assert!(names(&machine, r#"{"x": 5.000001}"#).is_empty());
    }

    #[test]
    fn wildcard_scenario() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"s": [{"wildcard": "he*lo"}]}"#).unwrap();
        for hit in ["helo", "hello", "hexxxlo"] {
            let event = format!(r#"{{"s": "{}"}}"#, hit);
            assert_eq!(names(&machine, &event), vec!["r".to_string()]);
        }
        for miss in ["helox", "hel"] {
            let event = format!(r#"{{"s": "{}"}}"#, miss);
            assert!(names(&machine, &event).is_empty());
        }
    }

    #[test]
    fn cidr_scenario() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"ip": [{"cidr": "10.0.0.0/24"}]}"#).unwrap();
        for hit in ["10.0.0.0", "10.0.0.255"] {
            let event = format!(r#"{{"ip": "{}"}}"#, hit);
            assert_eq!(names(&machine, &event), vec!["r".to_string()]);
        }
        assert!(names(&machine, r#"{"ip": "10.0.1.0"}"#).is_empty());
    }

    #[test]
    fn array_consistent_rejection() {
        let mut machine = Machine::new();
        machine
            .add_rule(
                "r",
                r#"{"employees": {"firstName": ["Anna"], "lastName": ["Jones"]}}"#,
            )
            .unwrap();
        let stitched = r#"{"employees": [
            {"firstName": "Anna", "lastName": "Smith"},
            {"firstName": "Peter", "lastName": "Jones"}
        ]}"#;
        assert!(names(&machine, stitched).is_empty());
        let honest = r#"{"employees": [
            {"firstName": "Anna", "lastName": "Jones"},
            {"firstName": "Peter", "lastName": "Smith"}
        ]}"#;
        assert_eq!(names(&machine, honest), vec!["r".to_string()]);
    }

    #[test]
    fn legacy_matcher_accepts_stitched_fields() {
        let mut machine = Machine::new();
        machine
            .add_rule(
                "r",
                r#"{"employees": {"firstName": ["Anna"], "lastName": ["Jones"]}}"#,
            )
            .unwrap();
        // Pre-flattened, name-sorted, no array tracking: the very match
        // the array-consistent flavour rejects.
        let found = machine.rules_for_event(&[
            "employees.firstName",
            "\"Anna\"",
            "employees.firstName",
            "\"Peter\"",
            "employees.lastName",
            "\"Jones\"",
            "employees.lastName",
            "\"Smith\"",
        ]);
        assert_eq!(found, vec!["r".to_string()]);
    }

    #[test]
    fn absence_scenario() {
        let mut machine = Machine::new();
        machine
            .add_rule(
                "r",
                r#"{"a": ["x"], "b": [{"exists": false}]}"#,
            )
            .unwrap();
        assert_eq!(
            names(&machine, r#"{"a": "x"}"#),
            vec!["r".to_string()],
        );
        assert!(names(&machine, r#"{"a": "x", "b": 1}"#).is_empty());
    }

    #[test]
    fn absence_alone_matches_anything_without_the_field() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"b": [{"exists": false}]}"#).unwrap();
        assert_eq!(
            names(&machine, r#"{"a": "x"}"#),
            vec!["r".to_string()],
        );
        assert_eq!(names(&machine, r#"{}"#), vec!["r".to_string()]);
        assert!(names(&machine, r#"{"b": "x"}"#).is_empty());
    }

    #[test]
    fn absence_inside_array_respects_membership() {
        let mut machine = Machine::new();
        machine
            .add_rule(
                "r",
                r#"{"a": {"x": ["1"], "y": [{"exists": false}]}}"#,
            )
            .unwrap();
        // The element holding x=1 has no y, even though a sibling does.
        let split = r#"{"a": [{"x": "1"}, {"y": "2"}]}"#;
        assert_eq!(names(&machine, split), vec!["r".to_string()]);
        // Here y lives in the same element as x.
        let together = r#"{"a": [{"x": "1", "y": "2"}]}"#;
        assert!(names(&machine, together).is_empty());
    }

    #[test]
    fn exists_scenario() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"a": [{"exists": true}]}"#).unwrap();
        assert_eq!(
            names(&machine, r#"{"a": "anything"}"#),
            vec!["r".to_string()],
        );
        assert_eq!(
            names(&machine, r#"{"a": 17}"#),
            vec!["r".to_string()],
        );
        assert!(names(&machine, r#"{"b": "x"}"#).is_empty());
    }

    #[test]
    fn results_have_no_duplicates() {
        let mut machine = Machine::new();
        machine
            .add_rule("r", r#"{"a": ["x", {"prefix": "x"}, {"exists": true}]}"#)
            .unwrap();
        let found = names(&machine, r#"{"a": "x"}"#);
        assert_eq!(found, vec!["r".to_string()]);
    }

    #[test]
    fn repeated_paths_from_arrays_all_match() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"a": ["y"]}"#).unwrap();
        assert_eq!(
            names(&machine, r#"{"a": ["x", "y", "z"]}"#),
            vec!["r".to_string()],
        );
    }

    #[test]
    fn unmentioned_fields_are_skipped() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"m": ["1"], "z": ["2"]}"#).unwrap();
        let event = r#"{"a": 0, "m": "1", "q": 9, "z": "2", "zz": 3}"#;
        assert_eq!(names(&machine, event), vec!["r".to_string()]);
    }

    #[test]
    fn anything_but_end_to_end() {
        let mut machine = Machine::new();
        machine
            .add_rule("r", r#"{"state": [{"anything-but": ["stopped"]}]}"#)
            .unwrap();
        assert_eq!(
            names(&machine, r#"{"state": "running"}"#),
            vec!["r".to_string()],
        );
        assert!(names(&machine, r#"{"state": "stopped"}"#).is_empty());
        // Absent field is not a match: anything-but still requires the
        // field to be present.
        assert!(names(&machine, r#"{"other": 1}"#).is_empty());
    }

    #[test]
    fn numeric_spellings_collapse() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"x": [300]}"#).unwrap();
        for event in
            [r#"{"x": 300}"#, r#"{"x": 3.0e+2}"#, r#"{"x": 300.0000}"#]
        {
            assert_eq!(
                names(&machine, event),
                vec!["r".to_string()],
                "{event}",
            );
        }
        // A string is not a number, whatever it spells.
        assert!(names(&machine, r#"{"x": "300"}"#).is_empty());
    }

    // The array-consistent matcher never reports a match the legacy
    // flavour would miss.
    #[test]
    fn array_consistent_results_are_contained_in_legacy_results() {
        let mut machine = Machine::new();
        machine.add_rule("pair", r#"{"a": {"x": ["1"], "y": ["2"]}}"#).unwrap();
        machine.add_rule("lone", r#"{"a": {"x": ["1"]}}"#).unwrap();
        let event = r#"{"a": [{"x": "1"}, {"y": "2"}]}"#;
        let consistent = names(&machine, event);
        // Flattened without arrays: same fields, no membership.
        let legacy = machine.rules_for_event(&[
            "a.x", "\"1\"", "a.y", "\"2\"",
        ]);
        assert_eq!(consistent, vec!["lone".to_string()]);
        assert_eq!(legacy, vec!["lone".to_string(), "pair".to_string()]);
        for name in &consistent {
            assert!(legacy.contains(name));
        }
    }

    // Compiling a rule, printing one of its flattened path maps back as
    // JSON and re-compiling yields a machine that matches the same
    // events: dotted paths and nested objects are the same address.
    #[test]
    fn flattened_path_map_reparses_to_an_equivalent_machine() {
        let rule = r#"{"a": {"b": ["x", "y"]}, "c": ["z"]}"#;
        let expansions = crate::compiler::compile(rule).unwrap();
        assert_eq!(expansions.len(), 1);
        let mut printed = serde_json::Map::new();
        for (path, patterns) in &expansions[0] {
            let values: Vec<serde_json::Value> = patterns
                .iter()
                .map(|p| match p {
                    crate::pattern::Pattern::Exact(quoted) => {
                        quoted[1..quoted.len() - 1].into()
                    }
                    other => panic!("unexpected pattern {:?}", other),
                })
                .collect();
            printed.insert(path.clone(), values.into());
        }
        let reparsed = serde_json::Value::Object(printed).to_string();

        let mut original = Machine::new();
        original.add_rule("r", rule).unwrap();
        let mut roundtripped = Machine::new();
        roundtripped.add_rule("r", &reparsed).unwrap();
        for event in [
            r#"{"a": {"b": "x"}, "c": "z"}"#,
            r#"{"a": {"b": "y"}, "c": "z"}"#,
            r#"{"a": {"b": "x"}}"#,
            r#"{"a": {"b": "q"}, "c": "z"}"#,
        ] {
            assert_eq!(
                original.rules_for_json_event(event).unwrap(),
                roundtripped.rules_for_json_event(event).unwrap(),
                "{event}",
            );
        }
    }

    #[test]
    fn same_field_in_two_rules_with_shared_pattern() {
        let mut machine = Machine::new();
        machine.add_rule("exact", r#"{"a": ["x"]}"#).unwrap();
        machine.add_rule("loose", r#"{"a": [{"prefix": "x"}]}"#).unwrap();
        let found = names(&machine, r#"{"a": "x"}"#);
        assert_eq!(
            found,
            vec!["exact".to_string(), "loose".to_string()],
        );
        assert_eq!(
            names(&machine, r#"{"a": "xy"}"#),
            vec!["loose".to_string()],
        );
    }
}
