/*!
Модель шаблонов, которые принимает автомат.

Каждый шаблон несёт свой канонический ключ сопоставления: строковые виды
хранят значение в кавычках (`"\"foo\""`), числовые — каноническую
шестнадцатеричную форму, а виды без полезной нагрузки (`Exists`,
`Absent`) — ничего. Шаблоны неизменяемы и хешируемы по виду и нагрузке,
так что два логически равных шаблона делят один узел автомата.
*/

use std::collections::BTreeSet;

use crate::{Error, num};

/// Шаблон сопоставления для одного поля правила.
///
/// Строковые полезные нагрузки хранятся в форме с окружающими кавычками,
/// в том же виде, в каком значения событий попадают в байтовый автомат.
/// Числовые нагрузки хранятся в канонической шестнадцатеричной форме
/// фиксированной ширины.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Pattern {
    /// Точное совпадение значения.
    Exact(String),
    /// Совпадение по префиксу значения.
    Prefix(String),
    /// Совпадение по суффиксу значения.
    Suffix(String),
    /// Точное совпадение без учёта регистра.
    EqualsIgnoreCase(String),
    /// Совпадение с шаблоном, где `*` обозначает любую последовательность
    /// символов. `\*` и `\\` обозначают буквальные `*` и `\`.
    Wildcard(String),
    /// Числовое равенство в канонической форме.
    NumericEq(String),
    /// Числовой диапазон, возможно построенный из CIDR-блока.
    NumericRange(ValueRange),
    /// Совпадение с любым значением, кроме перечисленных. Для числового
    /// набора значения хранятся в канонической форме.
    AnythingBut {
        /// Запрещённые значения.
        values: BTreeSet<String>,
        /// Являются ли значения числами.
        numeric: bool,
    },
    /// Совпадение с любым значением, не равным ни одному из перечисленных
    /// без учёта регистра.
    AnythingButIgnoreCase(BTreeSet<String>),
    /// Совпадение с любым значением, не начинающимся ни с одного из
    /// перечисленных префиксов.
    AnythingButPrefix(BTreeSet<String>),
    /// Совпадение с любым значением, не заканчивающимся ни одним из
    /// перечисленных суффиксов.
    AnythingButSuffix(BTreeSet<String>),
    /// Совпадение с любым присутствующим значением поля.
    Exists,
    /// Требование отсутствия поля.
    Absent,
}

/// Кодировка значения события, в которой шаблон участвует в обходе
/// байтового автомата.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Encoding {
    /// Значение как есть (строки — в кавычках, литералы — без).
    Raw,
    /// Байты значения в обратном порядке, для суффиксов.
    Reversed,
    /// Каноническая числовая форма.
    Numeric,
    /// Шестнадцатеричная форма IP-адреса.
    Ip,
}

impl Pattern {
    /// Строит шаблон точного совпадения строки.
    pub fn exact(value: &str) -> Pattern {
        Pattern::Exact(json_quote(value))
    }

    /// Строит шаблон совпадения по префиксу.
    pub fn prefix(value: &str) -> Pattern {
        Pattern::Prefix(json_quote(value))
    }

    /// Строит шаблон совпадения по суффиксу.
    pub fn suffix(value: &str) -> Pattern {
        Pattern::Suffix(json_quote(value))
    }

    /// Строит шаблон совпадения без учёта регистра.
    pub fn equals_ignore_case(value: &str) -> Pattern {
        Pattern::EqualsIgnoreCase(json_quote(value))
    }

    /// Строит шаблон wildcard. Корректность экранирования проверяется
    /// при компиляции правила или добавлении шаблона в машину.
    pub fn wildcard(value: &str) -> Pattern {
        Pattern::Wildcard(json_quote(value))
    }

    /// Строит шаблон числового равенства.
    pub fn numeric_eq(value: f64) -> Result<Pattern, Error> {
        Ok(Pattern::NumericEq(num::canonicalize(value)?))
    }

    /// Строит шаблон «что угодно, кроме перечисленных строк».
    pub fn anything_but<I, S>(values: I) -> Pattern
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Pattern::AnythingBut {
            values: values
                .into_iter()
                .map(|v| json_quote(v.as_ref()))
                .collect(),
            numeric: false,
        }
    }

    /// Строит шаблон присутствия поля.
    pub fn exists() -> Pattern {
        Pattern::Exists
    }

    /// Строит шаблон отсутствия поля.
    pub fn absent() -> Pattern {
        Pattern::Absent
    }

    /// Кодировка, в которой совпадения этого шаблона собираются при
    /// обходе.
    pub(crate) fn encoding(&self) -> Encoding {
        match *self {
            Pattern::Suffix(_) | Pattern::AnythingButSuffix(_) => {
                Encoding::Reversed
            }
            Pattern::NumericEq(_) => Encoding::Numeric,
            Pattern::NumericRange(ref range) => {
                if range.cidr { Encoding::Ip } else { Encoding::Numeric }
            }
            Pattern::AnythingBut { numeric: true, .. } => Encoding::Numeric,
            _ => Encoding::Raw,
        }
    }

    /// Должно ли совпадение прийтись точно на последний байт значения.
    /// Префиксные и суффиксные виды срабатывают на любой позиции.
    pub(crate) fn needs_last_byte(&self) -> bool {
        !matches!(
            *self,
            Pattern::Prefix(_)
                | Pattern::Suffix(_)
                | Pattern::AnythingButPrefix(_)
                | Pattern::AnythingButSuffix(_)
        )
    }

}

/// Числовой диапазон в канонической шестнадцатеричной форме.
///
/// Обе границы — строки одной ширины; каждая граница может быть открытой
/// или закрытой. Диапазон, построенный из CIDR-блока, помечен и
/// сопоставляется с шестнадцатеричной формой IP-адресов вместо
/// канонической числовой формы.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ValueRange {
    pub(crate) bottom: Vec<u8>,
    pub(crate) open_bottom: bool,
    pub(crate) top: Vec<u8>,
    pub(crate) open_top: bool,
    pub(crate) cidr: bool,
}

impl ValueRange {
    /// Строит диапазон между двумя числами. Нижняя граница обязана быть
    /// строго меньше верхней.
    pub fn between(
        bottom: f64,
        open_bottom: bool,
        top: f64,
        open_top: bool,
    ) -> Result<ValueRange, Error> {
        let bottom_canon = num::canonicalize(bottom)?;
        let top_canon = num::canonicalize(top)?;
        debug_assert_eq!(bottom_canon.len(), num::CANONICAL_DIGITS);
        if bottom_canon >= top_canon {
            return Err(Error::new(crate::ErrorKind::MalformedPattern(
                format!("bounds must be ordered: {} >= {}", bottom, top),
            )));
        }
        Ok(ValueRange {
            bottom: bottom_canon.into_bytes(),
            open_bottom,
            top: top_canon.into_bytes(),
            open_top,
            cidr: false,
        })
    }

    /// Строит диапазон «меньше данного числа».
    pub fn less_than(top: f64, open_top: bool) -> Result<ValueRange, Error> {
        ValueRange::between(-num::MAX_NUM_MAGNITUDE, false, top, open_top)
    }

    /// Строит диапазон «больше данного числа».
    pub fn greater_than(
        bottom: f64,
        open_bottom: bool,
    ) -> Result<ValueRange, Error> {
        ValueRange::between(bottom, open_bottom, num::MAX_NUM_MAGNITUDE, false)
    }

    pub(crate) fn cidr_block(bottom: String, top: String) -> ValueRange {
        ValueRange {
            bottom: bottom.into_bytes(),
            open_bottom: false,
            top: top.into_bytes(),
            open_top: false,
            cidr: true,
        }
    }

    pub(crate) fn cidr_half_open(bottom: String, top: String) -> ValueRange {
        ValueRange {
            bottom: bottom.into_bytes(),
            open_bottom: false,
            top: top.into_bytes(),
            open_top: true,
            cidr: true,
        }
    }

    pub(crate) fn bottom(&self) -> &[u8] {
        &self.bottom
    }

    pub(crate) fn top(&self) -> &[u8] {
        &self.top
    }

    pub(crate) fn open_bottom(&self) -> bool {
        self.open_bottom
    }

    pub(crate) fn open_top(&self) -> bool {
        self.open_top
    }
}

/// Оборачивает строку в кавычки — в той же форме значения событий
/// попадают в байтовый автомат. Внутренние кавычки намеренно не
/// экранируются: обе стороны сопоставления используют одно и то же
/// соглашение, так что формы согласованы.
pub(crate) fn json_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    quoted.push_str(value);
    quoted.push('"');
    quoted
}
