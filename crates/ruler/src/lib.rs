/*!
Крейт ruler предоставляет сопоставление наборов декларативных JSON-правил
с JSON-событиями.

Сопоставление набора правил — это процесс одновременной проверки одного
события против всех скомпилированных правил и возврата имён всех правил,
которым событие удовлетворяет. Набор компилируется в двухуровневый автомат:
внешний автомат последовательно сопоставляет имена полей, а вложенные
байтовые НКА сопоставляют значения. Благодаря этому время сопоставления
пропорционально размеру события, а не количеству правил в наборе.

# Пример: одно правило

```
use ruler::Machine;

let mut machine = Machine::new();
machine.add_rule(
    "running-things",
    r#"{"detail": {"state": ["running", "initializing"]}}"#,
)?;

let found = machine.rules_for_json_event(
    r#"{"detail": {"state": "running"}}"#,
)?;
assert_eq!(found, vec!["running-things".to_string()]);
# Ok::<(), ruler::Error>(())
```

# Пример: несколько правил одновременно

```
use ruler::Machine;

let mut machine = Machine::new();
machine.add_rule("by-prefix", r#"{"source": [{"prefix": "aws."}]}"#)?;
machine.add_rule("by-range", r#"{"size": [{"numeric": [">", 0, "<=", 5]}]}"#)?;
machine.add_rule("by-both", r#"{"source": ["aws.ec2"], "size": [3]}"#)?;

let found = machine.rules_for_json_event(
    r#"{"source": "aws.ec2", "size": 3}"#,
)?;
assert_eq!(found.len(), 3);
# Ok::<(), ruler::Error>(())
```

# Грамматика правил

Правило — это JSON-объект. Листовые значения — непустые массивы: каждый
элемент массива задаёт альтернативу для поля (дизъюнкция внутри поля,
конъюнкция между полями). Элемент массива — это либо примитив (строка,
число, `true`/`false`/`null`), либо объект-matcher с одним из ключей
`prefix`, `suffix`, `equals-ignore-case`, `wildcard`, `exactly`, `exists`,
`cidr`, `numeric`, `anything-but`. Вложенные объекты расширяют путь поля
через `.`. Зарезервированный ключ `$or` с массивом минимум из двух
объектов без matcher-ключей разворачивается в дизъюнкцию под-правил;
во всех остальных случаях `$or` трактуется как обычное имя поля.

Обратите внимание, что вложенное `{"a": {"b": ...}}` и плоское
`{"a.b": ...}` сопоставляются с одним и тем же путём `a.b` — как на
стороне правила, так и на стороне события. Это соглашение одинаково
для добавления и сопоставления.

# Массивы в событиях

Поля, пришедшие из разных элементов одного массива события, не могут
совместно удовлетворить одно правило: [`Machine::rules_for_json_event`]
отслеживает принадлежность каждого поля элементам массивов и отбрасывает
«сшитые» совпадения. Устаревший вход [`Machine::rules_for_event`] этой
проверки не делает.
*/

#![deny(missing_docs)]

#[cfg(feature = "log")]
macro_rules! debug {
    ($($token:tt)*) => (::log::debug!($($token)*);)
}

#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($token:tt)*) => {};
}

pub use crate::{
    compiler::{check, compile},
    event::{ArrayMembership, Event, Field},
    machine::{Machine, matches_rule},
    pattern::{Pattern, ValueRange},
};

mod bytemachine;
mod bytemap;
mod cidr;
mod compiler;
mod complexity;
mod event;
mod input;
mod machine;
mod matcher;
mod namestate;
mod num;
mod pattern;

/// Представляет ошибку, которая может возникнуть при разборе правила
/// или события.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Имя правила, если оно известно в точке возникновения.
    rule: Option<String>,
    /// Вид ошибки.
    kind: ErrorKind,
}

/// Вид ошибки, которая может возникнуть при разборе правила или события.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Возникает, когда правило или событие не является корректным JSON.
    MalformedJson(String),
    /// Возникает, когда верхний уровень правила — не объект.
    RuleNotObject,
    /// Возникает при пустом листовом массиве или пустом промежуточном
    /// объекте в правиле.
    EmptyArrayOrObject,
    /// Возникает при неизвестном ключе matcher-объекта.
    UnknownMatcher(String),
    /// Возникает, когда полезная нагрузка matcher-объекта имеет
    /// неподходящий тип или форму.
    MalformedPattern(String),
    /// Возникает, когда CIDR-блок или IP-литерал не удаётся разобрать.
    MalformedCidr(String),
    /// Возникает, когда число выходит за пределы ±5·10⁹.
    NumericRangeExceeded(String),
    /// Возникает в шаблоне `wildcard` на `\x`, где `x` — не `*` и не `\`.
    InvalidEscape(char),
    /// Возникает на `**` в шаблоне `wildcard`.
    ConsecutiveWildcards,
    /// Возникает, когда неэкранированный `\` стоит в конце шаблона
    /// `wildcard`.
    DanglingEscape,
    /// Возникает, когда `$or` распознан как дизъюнкция, но её форма
    /// некорректна.
    OrMalformed(String),
}

impl std::error::Error for Error {}

impl Error {
    /// Возвращает имя правила, вызвавшего эту ошибку, если оно известно.
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }

    /// Возвращает вид этой ошибки.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error { rule: None, kind }
    }

    pub(crate) fn with_rule(mut self, rule: &str) -> Error {
        if self.rule.is_none() {
            self.rule = Some(rule.to_string());
        }
        self
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rule {
            None => self.kind.fmt(f),
            Some(ref rule) => {
                write!(f, "error in rule '{}': {}", rule, self.kind)
            }
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ErrorKind::MalformedJson(ref detail) => {
                write!(f, "некорректный JSON: {}", detail)
            }
            ErrorKind::RuleNotObject => {
                write!(f, "верхний уровень правила должен быть объектом")
            }
            ErrorKind::EmptyArrayOrObject => {
                write!(f, "пустой массив или объект в правиле")
            }
            ErrorKind::UnknownMatcher(ref key) => {
                write!(f, "неизвестный matcher '{}'", key)
            }
            ErrorKind::MalformedPattern(ref detail) => {
                write!(f, "некорректный шаблон: {}", detail)
            }
            ErrorKind::MalformedCidr(ref text) => {
                write!(f, "некорректный CIDR или IP-адрес '{}'", text)
            }
            ErrorKind::NumericRangeExceeded(ref value) => {
                write!(f, "число {} вне диапазона ±5e9", value)
            }
            ErrorKind::InvalidEscape(ch) => {
                write!(f, "некорректное экранирование '\\{}'", ch)
            }
            ErrorKind::ConsecutiveWildcards => {
                write!(f, "два '*' подряд в шаблоне wildcard")
            }
            ErrorKind::DanglingEscape => {
                write!(f, "висящий '\\' в конце шаблона wildcard")
            }
            ErrorKind::OrMalformed(ref detail) => {
                write!(f, "некорректный $or: {}", detail)
            }
        }
    }
}
