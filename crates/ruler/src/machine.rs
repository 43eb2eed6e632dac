/*!
Машина правил: внешний автомат имён и публичный интерфейс крейта.

Машина владеет ареной состояний имён; состояния ссылаются друг на друга
индексами через терминалы байтовых автоматов, так что циклических
владений нет. Правило компилируется в одно или несколько конъюнктивных
разворачиваний; каждое разворачивание получает свой идентификатор
под-правила и добавляется шаблон за шаблоном, переиспользуя уже
существующие состояния везде, где они структурно совпадают.
*/

use std::collections::{HashMap, HashSet};

use crate::{
    Error,
    compiler,
    event::Event,
    matcher,
    namestate::{NameState, NameStateId, START_STATE, SubRuleId},
    pattern::Pattern,
};

/// Скомпилированный набор правил.
///
/// Мутирующие операции ([`Machine::add_rule`], [`Machine::delete_rule`])
/// требуют `&mut self` и тем самым сериализуются заимствованием;
/// сопоставление читает машину без блокировок и безопасно выполняется
/// из нескольких потоков одновременно.
#[derive(Debug)]
pub struct Machine {
    names: Vec<Option<NameState>>,
    free_names: Vec<NameStateId>,
    rules: HashMap<String, RuleEntry>,
    rule_names: HashMap<u32, String>,
    next_rule: u32,
}

/// Поля одного разворачивания, отсортированные по пути.
type ExpansionFields = Vec<(String, Vec<Pattern>)>;

#[derive(Debug)]
struct RuleEntry {
    id: u32,
    next_expansion: u32,
    expansions: Vec<(u32, ExpansionFields)>,
}

impl Default for Machine {
    /// Создаёт пустую машину по умолчанию.
    fn default() -> Machine {
        Machine::new()
    }
}

impl Machine {
    /// Создаёт пустую машину.
    pub fn new() -> Machine {
        Machine {
            names: vec![Some(NameState::default())],
            free_names: vec![],
            rules: HashMap::new(),
            rule_names: HashMap::new(),
            next_rule: 0,
        }
    }

    /// Истинно, если машина не содержит ни одного правила: начальное
    /// состояние не имеет ни матчеров значений, ни матчеров отсутствия.
    pub fn is_empty(&self) -> bool {
        self.name(START_STATE).is_empty()
    }

    /// Компилирует правило и добавляет его шаблоны под данным именем.
    ///
    /// Каждое конъюнктивное разворачивание `$or` получает свой
    /// идентификатор под-правила, привязанный к имени. Повторное
    /// добавление того же правила под тем же именем ничего не меняет.
    /// При ошибке компиляции машина остаётся нетронутой.
    pub fn add_rule(&mut self, name: &str, rule_json: &str) -> Result<(), Error> {
        let compiled = compiler::compile(rule_json)
            .map_err(|err| err.with_rule(name))?;
        let mut added = 0;
        for map in compiled {
            let fields = normalize(map);
            let sub = {
                let next_rule = &mut self.next_rule;
                let rule_names = &mut self.rule_names;
                let entry = self
                    .rules
                    .entry(name.to_string())
                    .or_insert_with(|| {
                        let id = *next_rule;
                        *next_rule += 1;
                        rule_names.insert(id, name.to_string());
                        RuleEntry { id, next_expansion: 0, expansions: vec![] }
                    });
                if entry.expansions.iter().any(|(_, f)| *f == fields) {
                    None
                } else {
                    let sub = SubRuleId {
                        rule: entry.id,
                        expansion: entry.next_expansion,
                    };
                    entry.next_expansion += 1;
                    entry.expansions.push((sub.expansion, fields.clone()));
                    Some(sub)
                }
            };
            if let Some(sub) = sub {
                self.add_step(START_STATE, &fields, 0, sub)?;
                added += 1;
            }
        }
        debug!("added rule '{}'; {} new sub-rules", name, added);
        Ok(())
    }

    /// Убирает правило, добавленное под данным именем с данным JSON.
    ///
    /// Удаление устроено по принципу «наилучших усилий»: убираются
    /// только те разворачивания, которые были зарегистрированы под этим
    /// именем с такой же структурой. JSON другой формы удалит меньше
    /// под-правил, но никогда не повредит машину.
    pub fn delete_rule(
        &mut self,
        name: &str,
        rule_json: &str,
    ) -> Result<(), Error> {
        let compiled = compiler::compile(rule_json)
            .map_err(|err| err.with_rule(name))?;
        let Some(entry) = self.rules.get_mut(name) else {
            return Ok(());
        };
        let rule_id = entry.id;
        let mut victims: Vec<(u32, ExpansionFields)> = vec![];
        for map in compiled {
            let fields = normalize(map);
            if let Some(pos) =
                entry.expansions.iter().position(|(_, f)| *f == fields)
            {
                victims.push(entry.expansions.remove(pos));
            }
        }
        let empty = entry.expansions.is_empty();
        if empty {
            self.rules.remove(name);
            self.rule_names.remove(&rule_id);
        }
        for (expansion, fields) in &victims {
            let sub = SubRuleId { rule: rule_id, expansion: *expansion };
            self.delete_step(START_STATE, fields, 0, sub);
        }
        if !victims.is_empty() {
            self.collect_name_states();
        }
        debug!("deleted rule '{}'; {} sub-rules removed", name, victims.len());
        Ok(())
    }

    /// Возвращает имена всех правил, которым удовлетворяет событие,
    /// без повторов, в порядке возрастания. Поля, пришедшие из разных
    /// элементов одного массива события, не засчитываются одному
    /// правилу совместно.
    pub fn rules_for_json_event(
        &self,
        event_json: &str,
    ) -> Result<Vec<String>, Error> {
        let event = Event::from_json(event_json)?;
        Ok(matcher::rules_for_event(self, &event, true))
    }

    /// Устаревший вход: чередующийся список «имя, значение в JSON-форме»,
    /// заранее отсортированный по именам. Согласованность по массивам
    /// не проверяется, поэтому возможны ложные совпадения поперёк
    /// элементов массива; новый код должен использовать
    /// [`Machine::rules_for_json_event`].
    pub fn rules_for_event<S: AsRef<str>>(
        &self,
        name_values: &[S],
    ) -> Vec<String> {
        let event = Event::from_name_values(name_values);
        matcher::rules_for_event(self, &event, false)
    }

    fn add_step(
        &mut self,
        cur: NameStateId,
        fields: &[(String, Vec<Pattern>)],
        index: usize,
        sub: SubRuleId,
    ) -> Result<(), Error> {
        let (key, patterns) = &fields[index];
        let last = index + 1 == fields.len();
        let mut bindings: Vec<Option<NameStateId>> = vec![];
        {
            let state = self.name(cur);
            for pattern in patterns {
                let existing = if let Pattern::Absent = pattern {
                    state.absences.get(key).copied()
                } else {
                    state
                        .values
                        .get(key)
                        .and_then(|machine| machine.find_pattern(pattern))
                };
                bindings.push(existing);
            }
        }
        // New patterns join the state of the first already-bound one, so
        // logically equal additions share nodes.
        let fallback = match bindings.iter().flatten().next() {
            Some(&existing) => existing,
            None => self.alloc_name(),
        };
        let mut nexts: Vec<NameStateId> = vec![];
        for (pattern, existing) in patterns.iter().zip(&bindings) {
            let next = existing.unwrap_or(fallback);
            if existing.is_none() {
                if let Pattern::Absent = pattern {
                    self.name_mut(cur).absences.insert(key.clone(), next);
                } else {
                    self.name_mut(cur)
                        .values
                        .entry(key.clone())
                        .or_default()
                        .add_pattern(pattern, next)?;
                }
            }
            self.name_mut(next).add_sub_rule(pattern, sub, last);
            if !nexts.contains(&next) {
                nexts.push(next);
            }
        }
        if !last {
            for next in nexts {
                self.add_step(next, fields, index + 1, sub)?;
            }
        }
        Ok(())
    }

    fn delete_step(
        &mut self,
        cur: NameStateId,
        fields: &[(String, Vec<Pattern>)],
        index: usize,
        sub: SubRuleId,
    ) {
        let (key, patterns) = &fields[index];
        let last = index + 1 == fields.len();
        for pattern in patterns {
            let next = {
                let state = self.name(cur);
                if let Pattern::Absent = pattern {
                    state.absences.get(key).copied()
                } else {
                    state
                        .values
                        .get(key)
                        .and_then(|machine| machine.find_pattern(pattern))
                }
            };
            // A registered expansion is always present in full; a missing
            // binding just means a prior pattern of this leaf shared it.
            let Some(next) = next else { continue };
            if !last {
                self.delete_step(next, fields, index + 1, sub);
            }
            let unused = self.name_mut(next).remove_sub_rule(pattern, sub);
            if unused {
                let state = self.name_mut(cur);
                if let Pattern::Absent = pattern {
                    state.absences.remove(key);
                } else {
                    let mut machine_empty = false;
                    if let Some(machine) = state.values.get_mut(key) {
                        machine.delete_pattern(pattern);
                        machine_empty = machine.is_empty();
                    }
                    if machine_empty {
                        state.values.remove(key);
                    }
                }
            }
        }
    }

    // Frees name states no longer reachable from the start state.
    fn collect_name_states(&mut self) {
        let mut reachable: HashSet<NameStateId> =
            HashSet::from([START_STATE]);
        let mut queue = vec![START_STATE];
        while let Some(id) = queue.pop() {
            let state = self.name(id);
            let mut nexts: Vec<NameStateId> = state
                .values
                .values()
                .flat_map(|machine| machine.next_name_states())
                .collect();
            nexts.extend(state.absences.values().copied());
            for next in nexts {
                if reachable.insert(next) {
                    queue.push(next);
                }
            }
        }
        for i in 0..self.names.len() {
            let id = NameStateId(i as u32);
            if id != START_STATE
                && self.names[i].is_some()
                && !reachable.contains(&id)
            {
                self.names[i] = None;
                self.free_names.push(id);
            }
        }
    }

    fn alloc_name(&mut self) -> NameStateId {
        match self.free_names.pop() {
            Some(id) => {
                self.names[id.0 as usize] = Some(NameState::default());
                id
            }
            None => {
                self.names.push(Some(NameState::default()));
                NameStateId((self.names.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn name(&self, id: NameStateId) -> &NameState {
        // Arena slots referenced by live transitions are always live.
        self.names[id.0 as usize].as_ref().expect("live name state")
    }

    fn name_mut(&mut self, id: NameStateId) -> &mut NameState {
        self.names[id.0 as usize].as_mut().expect("live name state")
    }

    pub(crate) fn rule_name_of(&self, rule: u32) -> &str {
        self.rule_names.get(&rule).map(|s| s.as_str()).unwrap_or("")
    }
}

/// Проверяет, удовлетворяет ли событие правилу, без предварительно
/// построенной машины: правило компилируется во временную машину и
/// событие прогоняется через неё.
///
/// ```
/// use ruler::matches_rule;
///
/// assert!(matches_rule(
///     r#"{"state": "running", "weight": 3}"#,
///     r#"{"weight": [{"numeric": ["<", 10]}]}"#,
/// )?);
/// assert!(!matches_rule(
///     r#"{"state": "running"}"#,
///     r#"{"weight": [{"numeric": ["<", 10]}]}"#,
/// )?);
/// # Ok::<(), ruler::Error>(())
/// ```
pub fn matches_rule(event_json: &str, rule_json: &str) -> Result<bool, Error> {
    let mut machine = Machine::new();
    machine.add_rule("rule", rule_json)?;
    Ok(!machine.rules_for_json_event(event_json)?.is_empty())
}

fn normalize(map: HashMap<String, Vec<Pattern>>) -> ExpansionFields {
    let mut fields: ExpansionFields = map.into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, patterns) in &mut fields {
        let mut seen: Vec<Pattern> = vec![];
        patterns.retain(|pattern| {
            if seen.contains(pattern) {
                false
            } else {
                seen.push(pattern.clone());
                true
            }
        });
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::{Machine, matches_rule};
    use crate::ErrorKind;

    #[test]
    fn empty_machine_matches_nothing() {
        let machine = Machine::new();
        assert!(machine.is_empty());
        assert_eq!(
            machine.rules_for_json_event(r#"{"a": 1}"#).unwrap(),
            Vec::<String>::new(),
        );
    }

    #[test]
    fn basic_exact_match() {
        let mut machine = Machine::new();
        machine
            .add_rule(
                "r",
                r#"{"detail": {"state": ["running", "initializing"]}}"#,
            )
            .unwrap();
        let found = machine
            .rules_for_json_event(r#"{"detail": {"state": "running"}}"#)
            .unwrap();
        assert_eq!(found, vec!["r".to_string()]);
        let missed = machine
            .rules_for_json_event(r#"{"detail": {"state": "stopped"}}"#)
            .unwrap();
        assert!(missed.is_empty());
    }

    #[test]
    fn add_then_delete_returns_to_empty() {
        let rule = r#"{
            "source": ["aws.ec2"],
            "detail": {
                "state": [{"prefix": "run"}],
                "size": [{"numeric": [">", 0, "<=", 5]}]
            }
        }"#;
        let mut machine = Machine::new();
        machine.add_rule("r", rule).unwrap();
        assert!(!machine.is_empty());
        machine.delete_rule("r", rule).unwrap();
        assert!(machine.is_empty());
    }

    #[test]
    fn add_is_idempotent() {
        let rule = r#"{"a": ["x"]}"#;
        let mut machine = Machine::new();
        machine.add_rule("r", rule).unwrap();
        machine.add_rule("r", rule).unwrap();
        machine.delete_rule("r", rule).unwrap();
        assert!(machine.is_empty());
    }

    #[test]
    fn delete_with_different_shape_is_best_effort() {
        let mut machine = Machine::new();
        machine.add_rule("r", r#"{"a": ["x"]}"#).unwrap();
        machine.delete_rule("r", r#"{"a": ["y"]}"#).unwrap();
        // Nothing matched the supplied shape, so nothing was removed.
        let found =
            machine.rules_for_json_event(r#"{"a": "x"}"#).unwrap();
        assert_eq!(found, vec!["r".to_string()]);
    }

    #[test]
    fn delete_keeps_sibling_rules() {
        let mut machine = Machine::new();
        machine.add_rule("one", r#"{"a": ["x"]}"#).unwrap();
        machine.add_rule("two", r#"{"a": ["x"], "b": ["y"]}"#).unwrap();
        machine.delete_rule("two", r#"{"a": ["x"], "b": ["y"]}"#).unwrap();
        let found = machine
            .rules_for_json_event(r#"{"a": "x", "b": "y"}"#)
            .unwrap();
        assert_eq!(found, vec!["one".to_string()]);
    }

    #[test]
    fn two_rules_shared_prefix() {
        let mut machine = Machine::new();
        machine.add_rule("one", r#"{"a": ["x"], "b": ["y"]}"#).unwrap();
        machine.add_rule("two", r#"{"a": ["x"], "c": ["z"]}"#).unwrap();
        let found = machine
            .rules_for_json_event(r#"{"a": "x", "b": "y", "c": "z"}"#)
            .unwrap();
        assert_eq!(found, vec!["one".to_string(), "two".to_string()]);
        let found =
            machine.rules_for_json_event(r#"{"a": "x", "c": "z"}"#).unwrap();
        assert_eq!(found, vec!["two".to_string()]);
    }

    #[test]
    fn or_expands_into_sub_rules() {
        let mut machine = Machine::new();
        machine
            .add_rule(
                "r",
                r#"{"source": ["aws.x"], "$or": [{"m": ["A"]}, {"n": ["B"]}]}"#,
            )
            .unwrap();
        for event in [
            r#"{"source": "aws.x", "m": "A"}"#,
            r#"{"source": "aws.x", "n": "B"}"#,
        ] {
            assert_eq!(
                machine.rules_for_json_event(event).unwrap(),
                vec!["r".to_string()],
            );
        }
        assert!(machine
            .rules_for_json_event(r#"{"source": "aws.x", "m": "B"}"#)
            .unwrap()
            .is_empty());
        assert!(machine
            .rules_for_json_event(r#"{"m": "A"}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn or_rule_deletes_both_sub_rules() {
        let rule = r#"{"$or": [{"m": ["A"]}, {"n": ["B"]}]}"#;
        let mut machine = Machine::new();
        machine.add_rule("r", rule).unwrap();
        machine.delete_rule("r", rule).unwrap();
        assert!(machine.is_empty());
    }

    #[test]
    fn bad_rule_leaves_machine_unchanged() {
        let mut machine = Machine::new();
        let err = machine.add_rule("r", r#"{"a": []}"#).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::EmptyArrayOrObject);
        assert_eq!(err.rule(), Some("r"));
        assert!(machine.is_empty());
    }

    #[test]
    fn matches_rule_compiles_and_matches() {
        assert!(matches_rule(
            r#"{"a": "x"}"#,
            r#"{"a": ["x", "y"]}"#,
        )
        .unwrap());
        assert!(!matches_rule(r#"{"a": "z"}"#, r#"{"a": ["x", "y"]}"#)
            .unwrap());
    }

    #[test]
    fn dotted_key_collides_with_nested_path() {
        let mut machine = Machine::new();
        machine.add_rule("nested", r#"{"a": {"b": ["x"]}}"#).unwrap();
        let found =
            machine.rules_for_json_event(r#"{"a.b": "x"}"#).unwrap();
        assert_eq!(found, vec!["nested".to_string()]);
    }

    #[test]
    fn malformed_event_is_reported() {
        let machine = Machine::new();
        let err = machine.rules_for_json_event("{oops").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedJson(_)));
    }
}
