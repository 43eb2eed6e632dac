/*!
Байтовый НКА для значений одного поля.

Машина хранит все шаблоны одного имени поля поверх байтовых переходов и
по данному значению возвращает множество пар «следующее состояние имени,
сработавший шаблон». Состояния и совпадения живут в аренах и адресуются
индексами; множество целей в байтовой карте играет роль составного
перехода, а набор текущих состояний при обходе — роль компаунда НКА.

Суффиксные шаблоны хранятся в обращённом виде и сопоставляются с
обращённым значением; числовые — с канонической формой значения;
CIDR-диапазоны — с шестнадцатеричной формой IP-литерала. Обход
прогоняет значение в каждой кодировке, для которой в машине есть хотя
бы один шаблон, и собирает совпадение только в «его» кодировке.
*/

use std::collections::{HashMap, HashSet};

use bstr::ByteSlice;

use crate::{
    Error,
    bytemap::{ByteMap, ByteStateId, MatchId, Target},
    cidr,
    input::{self, InputChar},
    namestate::NameStateId,
    num,
    pattern::{Encoding, Pattern},
};

const START: ByteStateId = ByteStateId(0);

const HEX_DIGITS: [u8; 16] = *b"0123456789ABCDEF";

/// Одно байтовое состояние: карта исходящих переходов и флаг
/// неопределённого префикса.
#[derive(Debug, Default)]
pub(crate) struct ByteState {
    pub(crate) map: ByteMap,
    /// Set when more than one input sequence can reach this state (after
    /// a wildcard, inside a range trie tail, behind case-fold forks).
    /// Such states are never reused as path anchors during addition.
    indeterminate: bool,
}

/// Терминал: шаблон и состояние имени, в которое ведёт его срабатывание.
#[derive(Debug)]
pub(crate) struct ByteMatch {
    pub(crate) pattern: Pattern,
    pub(crate) next_name: NameStateId,
    /// Exclusion matches mark forbidden values of an anything-but
    /// pattern; their firing suppresses the pattern instead of
    /// producing a transition.
    exclusion: bool,
}

/// Байтовый автомат всех шаблонов одного имени поля.
#[derive(Debug)]
pub(crate) struct ByteMachine {
    states: Vec<Option<ByteState>>,
    free_states: Vec<ByteStateId>,
    matches: Vec<Option<ByteMatch>>,
    free_matches: Vec<MatchId>,
    // Per-encoding pattern counts; a zero count skips the whole run.
    reversed_patterns: usize,
    numeric_patterns: usize,
    ip_patterns: usize,
    // Anything-but pattern => its next name state. Consulted after all
    // runs: the pattern fires unless one of its exclusions fired.
    anything_buts: HashMap<Pattern, NameStateId>,
}

impl Default for ByteMachine {
    fn default() -> ByteMachine {
        ByteMachine::new()
    }
}

impl ByteMachine {
    pub(crate) fn new() -> ByteMachine {
        ByteMachine {
            states: vec![Some(ByteState::default())],
            free_states: vec![],
            matches: vec![],
            free_matches: vec![],
            reversed_patterns: 0,
            numeric_patterns: 0,
            ip_patterns: 0,
            anything_buts: HashMap::new(),
        }
    }

    /// Истинно, если в машине не осталось ни одного шаблона.
    pub(crate) fn is_empty(&self) -> bool {
        self.matches.iter().all(Option::is_none)
            && self.anything_buts.is_empty()
    }

    /// Возвращает состояние имени, к которому уже привязан данный шаблон.
    pub(crate) fn find_pattern(
        &self,
        pattern: &Pattern,
    ) -> Option<NameStateId> {
        if let Some(&next) = self.anything_buts.get(pattern) {
            return Some(next);
        }
        self.matches
            .iter()
            .flatten()
            .find(|m| !m.exclusion && m.pattern == *pattern)
            .map(|m| m.next_name)
    }

    /// Добавляет шаблон, ведущий в данное состояние имени. Повторное
    /// добавление уже известного шаблона — дело вызывающей стороны:
    /// она обязана сперва спросить [`ByteMachine::find_pattern`].
    pub(crate) fn add_pattern(
        &mut self,
        pattern: &Pattern,
        next: NameStateId,
    ) -> Result<(), Error> {
        match *pattern {
            Pattern::Exact(ref v) => {
                self.add_chars(&input::exact_chars(v), pattern, next, false);
            }
            Pattern::Prefix(ref v) => {
                self.add_chars(&input::prefix_chars(v), pattern, next, false);
            }
            Pattern::Suffix(ref v) => {
                self.add_chars(&input::suffix_chars(v), pattern, next, false);
                self.reversed_patterns += 1;
            }
            Pattern::EqualsIgnoreCase(ref v) => {
                self.add_chars(
                    &input::ignore_case_chars(v),
                    pattern,
                    next,
                    false,
                );
            }
            Pattern::Wildcard(ref v) => {
                let chars = input::wildcard_chars(v)?;
                self.add_chars(&chars, pattern, next, false);
            }
            Pattern::NumericEq(ref v) => {
                self.add_chars(
                    &input::raw_chars(v.as_bytes()),
                    pattern,
                    next,
                    false,
                );
                self.numeric_patterns += 1;
            }
            Pattern::NumericRange(ref range) => {
                self.add_range(range, pattern, next);
                if range.cidr {
                    self.ip_patterns += 1;
                } else {
                    self.numeric_patterns += 1;
                }
            }
            Pattern::AnythingBut { ref values, numeric } => {
                for v in values {
                    let chars = if numeric {
                        input::raw_chars(v.as_bytes())
                    } else {
                        input::exact_chars(v)
                    };
                    self.add_chars(&chars, pattern, next, true);
                }
                self.anything_buts.insert(pattern.clone(), next);
                if numeric {
                    self.numeric_patterns += 1;
                }
            }
            Pattern::AnythingButIgnoreCase(ref values) => {
                for v in values {
                    self.add_chars(
                        &input::ignore_case_chars(v),
                        pattern,
                        next,
                        true,
                    );
                }
                self.anything_buts.insert(pattern.clone(), next);
            }
            Pattern::AnythingButPrefix(ref values) => {
                for v in values {
                    self.add_chars(
                        &input::prefix_chars(v),
                        pattern,
                        next,
                        true,
                    );
                }
                self.anything_buts.insert(pattern.clone(), next);
            }
            Pattern::AnythingButSuffix(ref values) => {
                for v in values {
                    self.add_chars(
                        &input::suffix_chars(v),
                        pattern,
                        next,
                        true,
                    );
                }
                self.anything_buts.insert(pattern.clone(), next);
                self.reversed_patterns += 1;
            }
            Pattern::Exists => self.add_exists(pattern, next),
            // Absence patterns live in the name machine, not here.
            Pattern::Absent => debug_assert!(false, "absent pattern"),
        }
        Ok(())
    }

    /// Удаляет шаблон. Отсутствующий в машине шаблон — no-op.
    pub(crate) fn delete_pattern(&mut self, pattern: &Pattern) {
        let dead: Vec<MatchId> = self
            .matches
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.as_ref().is_some_and(|m| m.pattern == *pattern)
            })
            .map(|(i, _)| MatchId(i as u32))
            .collect();
        let registered = self.anything_buts.remove(pattern).is_some();
        if dead.is_empty() && !registered {
            return;
        }
        for state in self.states.iter_mut().flatten() {
            for &mid in &dead {
                state.map.remove_target(Target::Match(mid));
            }
        }
        for mid in dead {
            self.matches[mid.0 as usize] = None;
            self.free_matches.push(mid);
        }
        match *pattern {
            Pattern::Suffix(_) | Pattern::AnythingButSuffix(_) => {
                self.reversed_patterns -= 1;
            }
            Pattern::NumericEq(_)
            | Pattern::AnythingBut { numeric: true, .. } => {
                self.numeric_patterns -= 1;
            }
            Pattern::NumericRange(ref range) => {
                if range.cidr {
                    self.ip_patterns -= 1;
                } else {
                    self.numeric_patterns -= 1;
                }
            }
            _ => {}
        }
        self.prune();
    }

    /// Прогоняет значение через НКА и собирает пары «следующее состояние
    /// имени, сработавший шаблон». Обход никогда не ошибается: значение,
    /// «не подходящее» шаблону по типу, просто не даёт совпадения.
    pub(crate) fn transition_on(
        &self,
        value: &str,
        into: &mut Vec<(NameStateId, Pattern)>,
    ) {
        let mut excluded: HashSet<Pattern> = HashSet::new();
        self.run(value.as_bytes(), Encoding::Raw, into, &mut excluded);
        if self.reversed_patterns > 0 {
            let reversed: Vec<u8> = value.bytes().rev().collect();
            debug!("reversed run on {:?}", reversed.as_bstr());
            self.run(&reversed, Encoding::Reversed, into, &mut excluded);
        }
        if self.numeric_patterns > 0 {
            if let Ok(parsed) = value.parse::<f64>() {
                if let Ok(canon) = num::canonicalize(parsed) {
                    self.run(
                        canon.as_bytes(),
                        Encoding::Numeric,
                        into,
                        &mut excluded,
                    );
                }
            }
        }
        if self.ip_patterns > 0 {
            let inner = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'));
            if let Some(hex) = inner.and_then(cidr::parse_ip_literal) {
                self.run(hex.as_bytes(), Encoding::Ip, into, &mut excluded);
            }
        }
        for (pattern, &next) in &self.anything_buts {
            if !excluded.contains(pattern) {
                push_unique(into, next, pattern);
            }
        }
    }

    /// Состояния имён, достижимые из этой машины. Используется сборкой
    /// мусора состояний имён.
    pub(crate) fn next_name_states(
        &self,
    ) -> impl Iterator<Item = NameStateId> + '_ {
        self.matches
            .iter()
            .flatten()
            .filter(|m| !m.exclusion)
            .map(|m| m.next_name)
            .chain(self.anything_buts.values().copied())
    }

    pub(crate) fn live_states(
        &self,
    ) -> impl Iterator<Item = (ByteStateId, &ByteState)> {
        self.states.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|state| (ByteStateId(i as u32), state))
        })
    }

    pub(crate) fn match_pattern(&self, id: MatchId) -> &Pattern {
        &self.match_slot(id).pattern
    }

    fn run(
        &self,
        bytes: &[u8],
        encoding: Encoding,
        into: &mut Vec<(NameStateId, Pattern)>,
        excluded: &mut HashSet<Pattern>,
    ) {
        if bytes.is_empty() {
            return;
        }
        let mut cur: Vec<ByteStateId> = vec![START];
        let mut next: Vec<ByteStateId> = vec![];
        for (i, &b) in bytes.iter().enumerate() {
            let last = i + 1 == bytes.len();
            next.clear();
            for &sid in &cur {
                for &target in self.state(sid).map.get(b) {
                    match target {
                        Target::State(s) => {
                            // Wildcard self-loops land here once per
                            // step; the set keeps the frontier small.
                            if !next.contains(&s) {
                                next.push(s);
                            }
                        }
                        Target::Match(mid) => {
                            self.collect(mid, last, encoding, into, excluded);
                        }
                    }
                }
            }
            std::mem::swap(&mut cur, &mut next);
            if cur.is_empty() {
                break;
            }
        }
    }

    fn collect(
        &self,
        id: MatchId,
        at_last_byte: bool,
        encoding: Encoding,
        into: &mut Vec<(NameStateId, Pattern)>,
        excluded: &mut HashSet<Pattern>,
    ) {
        let m = self.match_slot(id);
        if m.pattern.encoding() != encoding {
            return;
        }
        if m.pattern.needs_last_byte() && !at_last_byte {
            return;
        }
        if m.exclusion {
            excluded.insert(m.pattern.clone());
        } else {
            push_unique(into, m.next_name, &m.pattern);
        }
    }

    // Threads an input character sequence through the machine, reusing
    // determinate states along the way, and attaches the match at the
    // final character.
    fn add_chars(
        &mut self,
        chars: &[InputChar],
        pattern: &Pattern,
        next: NameStateId,
        exclusion: bool,
    ) {
        let mid = self.alloc_match(ByteMatch {
            pattern: pattern.clone(),
            next_name: next,
            exclusion,
        });
        let mut anchors = vec![START];
        // Once a wildcard is seen, every state further down the path can
        // be reached by more than one input sequence.
        let mut tainted = false;
        let count = chars.len();
        for (i, ch) in chars.iter().enumerate() {
            let last = i + 1 == count;
            match *ch {
                InputChar::Byte(b) => {
                    if last {
                        for &a in &anchors {
                            self.state_mut(a).map.add(b, Target::Match(mid));
                        }
                    } else {
                        let nxt = self.continuation(anchors[0], b, tainted);
                        for &a in &anchors {
                            self.state_mut(a).map.add(b, Target::State(nxt));
                        }
                        anchors = vec![nxt];
                    }
                }
                InputChar::MultiByte(ref alternatives) => {
                    if last {
                        for alt in alternatives {
                            self.add_alt_bytes(&anchors, alt, Target::Match(mid));
                        }
                    } else {
                        let joint = self.alloc_state(true);
                        for alt in alternatives {
                            self.add_alt_bytes(
                                &anchors,
                                alt,
                                Target::State(joint),
                            );
                        }
                        anchors = vec![joint];
                    }
                }
                InputChar::Wildcard => {
                    let hub = self.wildcard_hub(&anchors);
                    if !anchors.contains(&hub) {
                        anchors.push(hub);
                    }
                    tainted = true;
                }
            }
        }
    }

    // One alternative byte sequence of a multi-byte input character.
    fn add_alt_bytes(
        &mut self,
        anchors: &[ByteStateId],
        bytes: &[u8],
        destination: Target,
    ) {
        let mut cur = anchors.to_vec();
        let count = bytes.len();
        for (j, &b) in bytes.iter().enumerate() {
            if j + 1 == count {
                for &a in &cur {
                    self.state_mut(a).map.add(b, destination);
                }
            } else {
                let nxt = self.alloc_state(true);
                for &a in &cur {
                    self.state_mut(a).map.add(b, Target::State(nxt));
                }
                cur = vec![nxt];
            }
        }
    }

    // Finds or creates the continuation state for one byte of a pattern
    // path. Only a determinate state behind a single-byte entry is a
    // valid anchor to extend; anything else gets a fresh state.
    fn continuation(
        &mut self,
        anchor: ByteStateId,
        b: u8,
        tainted: bool,
    ) -> ByteStateId {
        if !tainted {
            if let Some(existing) = self.reusable(anchor, b) {
                return existing;
            }
        }
        self.alloc_state(tainted)
    }

    fn reusable(&self, anchor: ByteStateId, b: u8) -> Option<ByteStateId> {
        let state = self.state(anchor);
        if !state.map.is_single_byte_entry(b) {
            return None;
        }
        state.map.get(b).iter().find_map(|&target| match target {
            Target::State(s)
                if s != anchor && !self.state(s).indeterminate =>
            {
                Some(s)
            }
            _ => None,
        })
    }

    // A wildcard is a state looping on every byte; the byte after the
    // wildcard exits both from the loop state and from the state before
    // it, which realizes the zero-length case.
    fn wildcard_hub(&mut self, anchors: &[ByteStateId]) -> ByteStateId {
        if let [anchor] = *anchors {
            let existing = self.state(anchor).map.targets().find_map(
                |target| match target {
                    Target::State(h)
                        if self.loops_on_all_bytes(h)
                            && self.covers_all_bytes(anchor, h) =>
                    {
                        Some(h)
                    }
                    _ => None,
                },
            );
            if let Some(hub) = existing {
                return hub;
            }
        }
        let hub = self.alloc_state(true);
        self.state_mut(hub).map.add_all(Target::State(hub));
        for &a in anchors {
            self.state_mut(a).map.add_all(Target::State(hub));
        }
        hub
    }

    fn loops_on_all_bytes(&self, id: ByteStateId) -> bool {
        self.state(id)
            .map
            .entries()
            .all(|(_, _, targets)| targets.contains(&Target::State(id)))
    }

    fn covers_all_bytes(&self, from: ByteStateId, to: ByteStateId) -> bool {
        self.state(from)
            .map
            .entries()
            .all(|(_, _, targets)| targets.contains(&Target::State(to)))
    }

    // An existence pattern accepts every non-empty byte sequence, and
    // every value has at least its quotes or one literal byte.
    fn add_exists(&mut self, pattern: &Pattern, next: NameStateId) {
        let mid = self.alloc_match(ByteMatch {
            pattern: pattern.clone(),
            next_name: next,
            exclusion: false,
        });
        let hub = self.alloc_state(true);
        self.state_mut(hub).map.add_all(Target::State(hub));
        self.state_mut(hub).map.add_all(Target::Match(mid));
        self.state_mut(START).map.add_all(Target::State(hub));
        self.state_mut(START).map.add_all(Target::Match(mid));
    }

    // Expands a range into a minimal digit trie over its canonical
    // digits: a shared path for the common prefix, then per-position
    // edges for the digits between the bounds, with don't-care tail
    // states for the open interior.
    fn add_range(
        &mut self,
        range: &crate::pattern::ValueRange,
        pattern: &Pattern,
        next: NameStateId,
    ) {
        let mid = self.alloc_match(ByteMatch {
            pattern: pattern.clone(),
            next_name: next,
            exclusion: false,
        });
        let bottom = range.bottom().to_vec();
        let top = range.top().to_vec();
        let count = bottom.len();
        debug_assert_eq!(count, top.len());
        let mut tails: Vec<Option<ByteStateId>> = vec![None; count];

        let mut cur = START;
        let mut pos = 0;
        while pos < count && bottom[pos] == top[pos] {
            if pos + 1 == count {
                // Identical bounds: a one-point range, or nothing at all
                // when an end is open.
                if !range.open_bottom() && !range.open_top() {
                    self.state_mut(cur)
                        .map
                        .add(bottom[pos], Target::Match(mid));
                } else {
                    self.matches[mid.0 as usize] = None;
                    self.free_matches.push(mid);
                }
                return;
            }
            let nxt = self.continuation(cur, bottom[pos], false);
            self.state_mut(cur).map.add(bottom[pos], Target::State(nxt));
            cur = nxt;
            pos += 1;
        }

        let low_i = digit_index(bottom[pos]);
        let high_i = digit_index(top[pos]);
        // Digits strictly between the bounds accept any continuation.
        for &d in &HEX_DIGITS[low_i + 1..high_i] {
            self.link_tail(cur, d, pos + 1, count, mid, &mut tails);
        }
        // Bottom edge: follow the bottom digits; below the divergence
        // point everything above each digit is inside the range. At the
        // divergence position itself the interior is already covered by
        // the span above, so only the exact digit descends.
        let mut cb = cur;
        for i in pos..count {
            let di = digit_index(bottom[i]);
            if i + 1 == count {
                if i > pos {
                    for &d in &HEX_DIGITS[di + 1..] {
                        self.state_mut(cb).map.add(d, Target::Match(mid));
                    }
                }
                if !range.open_bottom() {
                    self.state_mut(cb).map.add(bottom[i], Target::Match(mid));
                }
            } else {
                if i > pos {
                    for &d in &HEX_DIGITS[di + 1..] {
                        self.link_tail(cb, d, i + 1, count, mid, &mut tails);
                    }
                }
                let nxt = self.continuation(cb, bottom[i], false);
                self.state_mut(cb).map.add(bottom[i], Target::State(nxt));
                cb = nxt;
            }
        }
        // Top edge, mirrored.
        let mut ct = cur;
        for i in pos..count {
            let di = digit_index(top[i]);
            if i + 1 == count {
                if i > pos {
                    for &d in &HEX_DIGITS[..di] {
                        self.state_mut(ct).map.add(d, Target::Match(mid));
                    }
                }
                if !range.open_top() {
                    self.state_mut(ct).map.add(top[i], Target::Match(mid));
                }
            } else {
                if i > pos {
                    for &d in &HEX_DIGITS[..di] {
                        self.link_tail(ct, d, i + 1, count, mid, &mut tails);
                    }
                }
                let nxt = self.continuation(ct, top[i], false);
                self.state_mut(ct).map.add(top[i], Target::State(nxt));
                ct = nxt;
            }
        }
    }

    // Edge into the don't-care tail covering positions from..count.
    fn link_tail(
        &mut self,
        from: ByteStateId,
        digit: u8,
        tail_pos: usize,
        count: usize,
        mid: MatchId,
        tails: &mut Vec<Option<ByteStateId>>,
    ) {
        if tail_pos == count {
            self.state_mut(from).map.add(digit, Target::Match(mid));
        } else {
            let tail = self.tail_state(tail_pos, count, mid, tails);
            self.state_mut(from).map.add(digit, Target::State(tail));
        }
    }

    fn tail_state(
        &mut self,
        pos: usize,
        count: usize,
        mid: MatchId,
        tails: &mut Vec<Option<ByteStateId>>,
    ) -> ByteStateId {
        if let Some(t) = tails[pos] {
            return t;
        }
        let t = self.alloc_state(true);
        tails[pos] = Some(t);
        let destination = if pos + 1 == count {
            Target::Match(mid)
        } else {
            Target::State(self.tail_state(pos + 1, count, mid, tails))
        };
        self.state_mut(t).map.add_range(b'0', b'9', destination);
        self.state_mut(t).map.add_range(b'A', b'F', destination);
        t
    }

    // Drops states that can no longer reach a match, and states no
    // longer reachable from the start.
    fn prune(&mut self) {
        let mut alive: HashSet<ByteStateId> = HashSet::new();
        loop {
            let mut changed = false;
            for (id, state) in self.live_states() {
                if alive.contains(&id) {
                    continue;
                }
                let reaches = state.map.targets().any(|target| match target {
                    Target::Match(_) => true,
                    Target::State(s) => alive.contains(&s),
                });
                if reaches {
                    alive.insert(id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for i in 0..self.states.len() {
            let Some(state) = self.states[i].as_mut() else { continue };
            let dead_targets: Vec<Target> = state
                .map
                .targets()
                .filter(|target| {
                    matches!(target, Target::State(s) if !alive.contains(s))
                })
                .collect();
            for target in dead_targets {
                state.map.remove_target(target);
            }
        }
        let mut reachable = HashSet::from([START]);
        let mut queue = vec![START];
        while let Some(id) = queue.pop() {
            let targets: Vec<Target> = self.state(id).map.targets().collect();
            for target in targets {
                if let Target::State(s) = target {
                    if reachable.insert(s) {
                        queue.push(s);
                    }
                }
            }
        }
        for i in 0..self.states.len() {
            let id = ByteStateId(i as u32);
            if id != START
                && self.states[i].is_some()
                && !reachable.contains(&id)
            {
                self.states[i] = None;
                self.free_states.push(id);
            }
        }
    }

    fn alloc_state(&mut self, indeterminate: bool) -> ByteStateId {
        let state = ByteState { map: ByteMap::new(), indeterminate };
        match self.free_states.pop() {
            Some(id) => {
                self.states[id.0 as usize] = Some(state);
                id
            }
            None => {
                self.states.push(Some(state));
                ByteStateId((self.states.len() - 1) as u32)
            }
        }
    }

    fn alloc_match(&mut self, m: ByteMatch) -> MatchId {
        match self.free_matches.pop() {
            Some(id) => {
                self.matches[id.0 as usize] = Some(m);
                id
            }
            None => {
                self.matches.push(Some(m));
                MatchId((self.matches.len() - 1) as u32)
            }
        }
    }

    fn state(&self, id: ByteStateId) -> &ByteState {
        // Arena slots referenced by live transitions are always live.
        self.states[id.0 as usize].as_ref().expect("live byte state")
    }

    fn state_mut(&mut self, id: ByteStateId) -> &mut ByteState {
        self.states[id.0 as usize].as_mut().expect("live byte state")
    }

    fn match_slot(&self, id: MatchId) -> &ByteMatch {
        self.matches[id.0 as usize].as_ref().expect("live byte match")
    }
}

fn digit_index(digit: u8) -> usize {
    HEX_DIGITS
        .iter()
        .position(|&d| d == digit)
        .expect("canonical digits are upper-case hex")
}

fn push_unique(
    into: &mut Vec<(NameStateId, Pattern)>,
    next: NameStateId,
    pattern: &Pattern,
) {
    if !into.iter().any(|(n, p)| *n == next && p == pattern) {
        into.push((next, pattern.clone()));
    }
}
