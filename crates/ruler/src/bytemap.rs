/*!
Компактная упорядоченная карта байтовых диапазонов.

Карта хранит переходы байтового состояния: ключ — «потолок» диапазона
(исключительная верхняя граница, 1..=256), значение — множество целей,
достижимых по любому байту диапазона. Благодаря этому «все оставшиеся
байты» и «конкретные байты» хранятся без плотных массивов: карта всегда
покрывает все 256 байтов, а соседние диапазоны с равными множествами
склеиваются.
*/

use std::collections::BTreeMap;

/// Индекс байтового состояния в арене машины.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ByteStateId(pub(crate) u32);

/// Индекс совпадения в арене машины.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct MatchId(pub(crate) u32);

/// Цель перехода: либо следующее состояние, либо совпадение шаблона.
/// Пара «состояние + совпадение» в одном множестве играет роль
/// составного перехода.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum Target {
    /// Переход в байтовое состояние.
    State(ByteStateId),
    /// Срабатывание совпадения.
    Match(MatchId),
}

/// Карта диапазонов байтов в множества целей.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ByteMap {
    // Ceiling => set of targets for bytes in [previous ceiling, ceiling).
    // Invariant: the last key is always 256, so every byte is covered.
    ceilings: BTreeMap<u16, Vec<Target>>,
}

impl Default for ByteMap {
    fn default() -> ByteMap {
        ByteMap::new()
    }
}

const TOP: u16 = 256;

impl ByteMap {
    pub(crate) fn new() -> ByteMap {
        let mut ceilings = BTreeMap::new();
        ceilings.insert(TOP, vec![]);
        ByteMap { ceilings }
    }

    /// Возвращает множество целей для данного байта.
    pub(crate) fn get(&self, byte: u8) -> &[Target] {
        let (_, targets) = self
            .ceilings
            .range(u16::from(byte) + 1..)
            .next()
            .expect("byte map always covers every byte");
        targets
    }

    /// Истинно, если байт покрыт диапазоном ровно из одного байта.
    /// Такие записи означают «продолжение пути именно по этому байту»
    /// и только они пригодны для повторного использования состояний.
    pub(crate) fn is_single_byte_entry(&self, byte: u8) -> bool {
        let ceiling = u16::from(byte) + 1;
        if !self.ceilings.contains_key(&ceiling) {
            return false;
        }
        let floor = self
            .ceilings
            .range(..ceiling)
            .next_back()
            .map(|(&c, _)| c)
            .unwrap_or(0);
        ceiling - floor == 1
    }

    /// Добавляет цель для одного байта (объединение с существующими).
    pub(crate) fn add(&mut self, byte: u8, target: Target) {
        self.add_range(byte, byte, target);
    }

    /// Добавляет цель для всех байтов включительного диапазона.
    pub(crate) fn add_range(&mut self, low: u8, high: u8, target: Target) {
        self.split_at(u16::from(low));
        self.split_at(u16::from(high) + 1);
        for (_, targets) in
            self.ceilings.range_mut(u16::from(low) + 1..=u16::from(high) + 1)
        {
            if let Err(pos) = targets.binary_search(&target) {
                targets.insert(pos, target);
            }
        }
    }

    /// Добавляет цель для всех 256 байтов.
    pub(crate) fn add_all(&mut self, target: Target) {
        for targets in self.ceilings.values_mut() {
            if let Err(pos) = targets.binary_search(&target) {
                targets.insert(pos, target);
            }
        }
        self.merge_adjacent();
    }

    /// Убирает цель отовсюду, где она встречается.
    pub(crate) fn remove_target(&mut self, target: Target) {
        for targets in self.ceilings.values_mut() {
            if let Ok(pos) = targets.binary_search(&target) {
                targets.remove(pos);
            }
        }
        self.merge_adjacent();
    }

    /// Перебирает диапазоны карты: (нижняя граница, потолок, цели).
    pub(crate) fn entries(
        &self,
    ) -> impl Iterator<Item = (u16, u16, &[Target])> {
        let mut floor = 0;
        self.ceilings.iter().map(move |(&ceiling, targets)| {
            let entry = (floor, ceiling, targets.as_slice());
            floor = ceiling;
            entry
        })
    }

    /// Перебирает все цели карты без повторов.
    pub(crate) fn targets(&self) -> impl Iterator<Item = Target> {
        let mut seen: Vec<Target> = vec![];
        for targets in self.ceilings.values() {
            for &t in targets {
                if let Err(pos) = seen.binary_search(&t) {
                    seen.insert(pos, t);
                }
            }
        }
        seen.into_iter()
    }

    // Makes `position` a range boundary (no-op at 0, 256 or an existing
    // boundary).
    fn split_at(&mut self, position: u16) {
        if position == 0 || position >= TOP {
            return;
        }
        if self.ceilings.contains_key(&position) {
            return;
        }
        let (_, covering) = self
            .ceilings
            .range(position + 1..)
            .next()
            .expect("byte map always covers every byte");
        let cloned = covering.clone();
        self.ceilings.insert(position, cloned);
    }

    fn merge_adjacent(&mut self) {
        let keys: Vec<u16> = self.ceilings.keys().copied().collect();
        for ceiling in keys {
            if ceiling == TOP {
                continue;
            }
            let this = self.ceilings.get(&ceiling).cloned();
            let next = self
                .ceilings
                .range(ceiling + 1..)
                .next()
                .map(|(_, targets)| targets.clone());
            if this == next {
                self.ceilings.remove(&ceiling);
            }
        }
    }
}
