/*!
Оценка сложности скомпилированной машины.

Wildcard-шаблоны — единственный источник широкого недетерминизма в
байтовых автоматах: каждый wildcard добавляет петлю по всем байтам, и
несколько петель, живых одновременно, умножают ширину фронта обхода.
Оценка считает для каждого байтового состояния, сколько wildcard-
совпадений достижимо ниже него, берёт максимум суммы по переходам, а
затем рекурсивно спускается через терминалы в следующие состояния
имён: шаблоны последовательных полей живы на одном и том же обходе,
поэтому их вклады складываются. Результат ограничивается порогом,
чтобы вызывающая сторона могла отвергнуть патологические наборы
правил до сопоставления.
*/

use std::collections::{BTreeSet, HashMap};

use crate::{
    bytemachine::ByteMachine,
    bytemap::{ByteStateId, MatchId, Target},
    machine::Machine,
    namestate::{NameStateId, START_STATE},
    pattern::Pattern,
};

impl Machine {
    /// Возвращает неубывающую меру wildcard-ширины НКА машины,
    /// ограниченную порогом `max_complexity`. Оценка идёт от начального
    /// состояния имени и через терминалы совпадений спускается в
    /// следующие состояния имён, складывая вклады последовательных
    /// полей. Мера монотонно растёт при добавлении правил и
    /// используется, чтобы отвергать наборы правил с запретительно
    /// дорогим сопоставлением.
    pub fn evaluate_complexity(&self, max_complexity: usize) -> usize {
        let mut memo: HashMap<NameStateId, usize> = HashMap::new();
        name_state_breadth(self, START_STATE, max_complexity, &mut memo)
    }
}

// Worst wildcard breadth reachable from a name state: for each field
// matcher, its own breadth plus the worst breadth of the name states
// its matches lead into.
fn name_state_breadth(
    machine: &Machine,
    id: NameStateId,
    cap: usize,
    memo: &mut HashMap<NameStateId, usize>,
) -> usize {
    if let Some(&known) = memo.get(&id) {
        return known;
    }
    // Seeded before the walk so a revisit terminates.
    memo.insert(id, 0);
    let state = machine.name(id);
    let mut worst = 0;
    for value_matcher in state.values.values() {
        let own = byte_machine_breadth(value_matcher, cap);
        let mut downstream = 0;
        for next in value_matcher.next_name_states() {
            downstream = downstream
                .max(name_state_breadth(machine, next, cap, memo));
        }
        worst = worst.max(own + downstream);
    }
    for &next in state.absences.values() {
        worst = worst.max(name_state_breadth(machine, next, cap, memo));
    }
    let worst = worst.min(cap);
    memo.insert(id, worst);
    worst
}

fn byte_machine_breadth(machine: &ByteMachine, cap: usize) -> usize {
    // Wildcard matches reachable at or below every state, to a fixpoint.
    let mut reachable: HashMap<ByteStateId, BTreeSet<MatchId>> = machine
        .live_states()
        .map(|(id, _)| (id, BTreeSet::new()))
        .collect();
    loop {
        let mut changed = false;
        for (id, state) in machine.live_states() {
            let mut wildcards = reachable[&id].clone();
            for target in state.map.targets() {
                match target {
                    Target::Match(mid) => {
                        if let Pattern::Wildcard(_) =
                            machine.match_pattern(mid)
                        {
                            wildcards.insert(mid);
                        }
                    }
                    Target::State(s) => {
                        wildcards
                            .extend(reachable[&s].iter().copied());
                    }
                }
            }
            if wildcards.len() != reachable[&id].len() {
                reachable.insert(id, wildcards);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    // The breadth of a state is how many wildcard matches stay in play
    // across its outgoing transitions at once.
    let mut worst = 0;
    for (_, state) in machine.live_states() {
        let mut breadth = 0;
        for target in state.map.targets() {
            match target {
                Target::State(s) => breadth += reachable[&s].len(),
                Target::Match(mid) => {
                    if let Pattern::Wildcard(_) = machine.match_pattern(mid)
                    {
                        breadth += 1;
                    }
                }
            }
        }
        worst = worst.max(breadth);
        if worst >= cap {
            return cap;
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use crate::machine::Machine;

    const CAP: usize = 256;

    #[test]
    fn exact_rules_have_zero_complexity() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"a": ["x", "y", "z"]}"#).unwrap();
        assert_eq!(machine.evaluate_complexity(CAP), 0);
    }

    #[test]
    fn complexity_grows_with_wildcard_rules() {
        let mut machine = Machine::new();
        machine.add_rule("one", r#"{"a": [{"wildcard": "*x*"}]}"#).unwrap();
        let one = machine.evaluate_complexity(CAP);
        assert!(one >= 1);
        machine.add_rule("two", r#"{"a": [{"wildcard": "*y*"}]}"#).unwrap();
        let two = machine.evaluate_complexity(CAP);
        assert!(two >= one, "complexity must be monotone: {two} < {one}");
        machine.add_rule("three", r#"{"a": [{"wildcard": "*z*"}]}"#).unwrap();
        assert!(machine.evaluate_complexity(CAP) >= two);
    }

    // Wildcards of sequential fields are alive on one and the same
    // traversal, so a chain of wildcard fields must cost more than any
    // one of them alone.
    #[test]
    fn complexity_compounds_across_sequential_fields() {
        let mut single = Machine::new();
        single.add_rule("r", r#"{"a": [{"wildcard": "*x*"}]}"#).unwrap();
        let alone = single.evaluate_complexity(CAP);
        assert!(alone >= 1);

        let mut chained = Machine::new();
        chained
            .add_rule(
                "r",
                r#"{"a": [{"wildcard": "*x*"}], "b": [{"wildcard": "*y*"}]}"#,
            )
            .unwrap();
        let chain = chained.evaluate_complexity(CAP);
        assert!(
            chain > alone,
            "chained fields must compound: {chain} <= {alone}",
        );
    }

    #[test]
    fn complexity_is_clamped() {
        let mut machine = Machine::new();
        for i in 0..8 {
            let rule = format!(r#"{{"a": [{{"wildcard": "*{}*"}}]}}"#, i);
            machine.add_rule(&format!("r{}", i), &rule).unwrap();
        }
        assert_eq!(machine.evaluate_complexity(2), 2);
    }
}
