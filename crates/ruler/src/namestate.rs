/*!
Состояния внешнего автомата имён.

Состояние имени представляет «сколько полей уже сопоставлено». Оно
владеет байтовым автоматом для каждого имени поля, отдельным matcher'ом
отсутствия для шаблонов `{"exists": false}` и учётом под-правил: для
каждого шаблона, завершающегося в этом состоянии, хранится множество
под-правил, для которых срабатывание было промежуточным шагом, и
отдельно множество под-правил, для которых оно завершает сопоставление.
*/

use std::collections::{BTreeSet, HashMap};

use crate::{bytemachine::ByteMachine, pattern::Pattern};

/// Индекс состояния имени в арене машины.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct NameStateId(pub(crate) u32);

/// Начальное состояние каждой машины.
pub(crate) const START_STATE: NameStateId = NameStateId(0);

/// Идентификатор под-правила: одно конъюнктивное разворачивание правила.
///
/// Пара «номер правила, номер разворачивания» — этого достаточно, чтобы
/// обход пересекал «кандидатов на данный момент» с «под-правилами,
/// использующими этот шаблон», отсекая ветви, которые ни одно живое
/// под-правило не может завершить.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct SubRuleId {
    /// Номер правила в машине.
    pub(crate) rule: u32,
    /// Номер разворачивания внутри правила.
    pub(crate) expansion: u32,
}

#[derive(Debug, Default)]
pub(crate) struct NameState {
    /// Field name => byte machine holding every pattern for that field.
    pub(crate) values: HashMap<String, ByteMachine>,
    /// Absent field name => state entered once the absence is confirmed.
    pub(crate) absences: HashMap<String, NameStateId>,
    /// Sub-rules that step through this state via a pattern but still
    /// have more fields to satisfy.
    pub(crate) non_terminal: HashMap<Pattern, BTreeSet<SubRuleId>>,
    /// Sub-rules completed by the pattern firing into this state.
    pub(crate) terminal: HashMap<Pattern, BTreeSet<SubRuleId>>,
}

impl NameState {
    /// Истинно, если состояние ничего не хранит и может быть освобождено.
    pub(crate) fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.absences.is_empty()
            && self.non_terminal.is_empty()
            && self.terminal.is_empty()
    }

    /// Регистрирует шаг под-правила через данный шаблон.
    pub(crate) fn add_sub_rule(
        &mut self,
        pattern: &Pattern,
        id: SubRuleId,
        terminal: bool,
    ) {
        let map =
            if terminal { &mut self.terminal } else { &mut self.non_terminal };
        map.entry(pattern.clone()).or_default().insert(id);
    }

    /// Убирает шаг под-правила. Возвращает истину, если шаблон больше
    /// не упоминается ни в одной из двух карт и может быть удалён из
    /// соответствующего matcher'а.
    pub(crate) fn remove_sub_rule(
        &mut self,
        pattern: &Pattern,
        id: SubRuleId,
    ) -> bool {
        for map in [&mut self.non_terminal, &mut self.terminal] {
            if let Some(ids) = map.get_mut(pattern) {
                ids.remove(&id);
                if ids.is_empty() {
                    map.remove(pattern);
                }
            }
        }
        !self.non_terminal.contains_key(pattern)
            && !self.terminal.contains_key(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::{NameState, SubRuleId};
    use crate::pattern::Pattern;

    fn sub(rule: u32, expansion: u32) -> SubRuleId {
        SubRuleId { rule, expansion }
    }

    #[test]
    fn add_sub_rule_routes_by_terminality() {
        let mut state = NameState::default();
        let pattern = Pattern::exact("x");
        state.add_sub_rule(&pattern, sub(0, 0), false);
        state.add_sub_rule(&pattern, sub(0, 1), true);
        assert_eq!(
            state.non_terminal[&pattern].iter().copied().collect::<Vec<_>>(),
            vec![sub(0, 0)],
        );
        assert_eq!(
            state.terminal[&pattern].iter().copied().collect::<Vec<_>>(),
            vec![sub(0, 1)],
        );
    }

    #[test]
    fn remove_sub_rule_reports_when_both_maps_forget_the_pattern() {
        let mut state = NameState::default();
        let pattern = Pattern::exact("x");
        state.add_sub_rule(&pattern, sub(0, 0), false);
        state.add_sub_rule(&pattern, sub(1, 0), true);
        // One user remains, so the pattern must stay in its matcher.
        assert!(!state.remove_sub_rule(&pattern, sub(0, 0)));
        assert!(state.remove_sub_rule(&pattern, sub(1, 0)));
        assert!(state.is_empty());
    }

    #[test]
    fn remove_sub_rule_clears_both_maps_for_one_id() {
        // The same expansion can step through a pattern here and also
        // finish on it, via two different rule shapes sharing the state.
        let mut state = NameState::default();
        let pattern = Pattern::exact("x");
        state.add_sub_rule(&pattern, sub(0, 0), false);
        state.add_sub_rule(&pattern, sub(0, 0), true);
        assert!(state.remove_sub_rule(&pattern, sub(0, 0)));
        assert!(state.is_empty());
    }

    #[test]
    fn remove_sub_rule_touches_only_the_given_pattern() {
        let mut state = NameState::default();
        let kept = Pattern::exact("kept");
        let dropped = Pattern::exact("dropped");
        state.add_sub_rule(&kept, sub(0, 0), true);
        state.add_sub_rule(&dropped, sub(0, 0), true);
        assert!(state.remove_sub_rule(&dropped, sub(0, 0)));
        assert!(!state.is_empty());
        assert!(state.terminal.contains_key(&kept));
        assert!(!state.terminal.contains_key(&dropped));
    }

    #[test]
    fn remove_of_unknown_pattern_reports_unused() {
        let mut state = NameState::default();
        assert!(state.remove_sub_rule(&Pattern::exact("x"), sub(0, 0)));
    }
}
