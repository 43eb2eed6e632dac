/*!
Разбор значений шаблонов в последовательности входных символов.

Байтовый автомат строится не из байтов напрямую, а из входных символов:
одиночный байт, набор альтернативных байтовых последовательностей (для
сопоставления без учёта регистра) или маркер wildcard. Суффиксные
шаблоны разворачиваются побайтово, так что суффикс хранится в автомате
слева направо в обращённом виде.
*/

use crate::{Error, ErrorKind};

/// Один входной символ шаблона.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum InputChar {
    /// Одиночный байт.
    Byte(u8),
    /// Альтернативные байтовые последовательности одного логического
    /// символа, например оба регистра одной буквы.
    MultiByte(Vec<Vec<u8>>),
    /// Маркер wildcard: ноль или более любых байтов.
    Wildcard,
}

/// Входные символы точного совпадения: байты закавыченного значения
/// как есть.
pub(crate) fn exact_chars(quoted: &str) -> Vec<InputChar> {
    quoted.bytes().map(InputChar::Byte).collect()
}

/// Входные символы незакавыченного значения (канонические числа,
/// литералы `true`/`false`/`null`).
pub(crate) fn raw_chars(value: &[u8]) -> Vec<InputChar> {
    value.iter().copied().map(InputChar::Byte).collect()
}

/// Входные символы префикса: закрывающая кавычка отбрасывается, чтобы
/// путь заканчивался на последнем байте самого префикса.
pub(crate) fn prefix_chars(quoted: &str) -> Vec<InputChar> {
    let bytes = quoted.as_bytes();
    bytes[..bytes.len() - 1].iter().copied().map(InputChar::Byte).collect()
}

/// Входные символы суффикса: открывающая кавычка отбрасывается, а
/// остаток обращается побайтово. Значение события при сопоставлении
/// обращается тем же способом, так что многобайтовые символы UTF-8
/// сопоставляются корректно.
pub(crate) fn suffix_chars(quoted: &str) -> Vec<InputChar> {
    let bytes = quoted.as_bytes();
    bytes[1..].iter().rev().copied().map(InputChar::Byte).collect()
}

/// Входные символы совпадения без учёта регистра: каждый символ значения
/// заменяется набором из его нижнего и верхнего регистров.
pub(crate) fn ignore_case_chars(quoted: &str) -> Vec<InputChar> {
    let mut chars = vec![InputChar::Byte(b'"')];
    let inner = &quoted[1..quoted.len() - 1];
    for ch in inner.chars() {
        let (lower, upper) = fold_pair(ch);
        if lower == upper {
            chars.extend(encoded(lower).into_iter().map(InputChar::Byte));
        } else {
            chars.push(InputChar::MultiByte(vec![
                encoded(lower),
                encoded(upper),
            ]));
        }
    }
    chars.push(InputChar::Byte(b'"'));
    chars
}

/// Входные символы wildcard-шаблона.
///
/// Неэкранированный `*` — это маркер wildcard; `\*` и `\\` — буквальные
/// `*` и `\`; любое другое экранирование — ошибка разбора, как и два
/// `*` подряд.
pub(crate) fn wildcard_chars(quoted: &str) -> Result<Vec<InputChar>, Error> {
    let mut chars = vec![InputChar::Byte(b'"')];
    let inner = &quoted[1..quoted.len() - 1];
    let mut iter = inner.chars();
    let mut prev_wildcard = false;
    while let Some(ch) = iter.next() {
        match ch {
            '*' => {
                if prev_wildcard {
                    return Err(Error::new(ErrorKind::ConsecutiveWildcards));
                }
                chars.push(InputChar::Wildcard);
                prev_wildcard = true;
                continue;
            }
            '\\' => match iter.next() {
                Some('*') => chars.push(InputChar::Byte(b'*')),
                Some('\\') => chars.push(InputChar::Byte(b'\\')),
                Some(other) => {
                    return Err(Error::new(ErrorKind::InvalidEscape(other)));
                }
                None => {
                    return Err(Error::new(ErrorKind::DanglingEscape));
                }
            },
            ch => {
                chars.extend(encoded(ch).into_iter().map(InputChar::Byte));
            }
        }
        prev_wildcard = false;
    }
    chars.push(InputChar::Byte(b'"'));
    Ok(chars)
}

fn encoded(ch: char) -> Vec<u8> {
    let mut buf = [0u8; 4];
    ch.encode_utf8(&mut buf).as_bytes().to_vec()
}

// One-to-one case folding. Characters whose case mapping expands to more
// than one character (like ß) are left as they are.
fn fold_pair(ch: char) -> (char, char) {
    let mut lower = ch.to_lowercase();
    let mut upper = ch.to_uppercase();
    let lower = match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => ch,
    };
    let upper = match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => ch,
    };
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::{
        InputChar, exact_chars, ignore_case_chars, suffix_chars,
        wildcard_chars,
    };
    use crate::{ErrorKind, pattern::json_quote};

    macro_rules! wcerr {
        ($name:ident, $value:expr, $kind:pat) => {
            #[test]
            fn $name() {
                let err =
                    wildcard_chars(&json_quote($value)).unwrap_err();
                assert!(matches!(err.kind(), $kind));
            }
        };
    }

    fn bytes(chars: &[InputChar]) -> Vec<u8> {
        chars
            .iter()
            .map(|c| match c {
                InputChar::Byte(b) => *b,
                _ => panic!("expected only single bytes"),
            })
            .collect()
    }

    #[test]
    fn exact_keeps_quotes() {
        assert_eq!(bytes(&exact_chars("\"ab\"")), b"\"ab\"");
    }

    #[test]
    fn suffix_is_reversed() {
        assert_eq!(bytes(&suffix_chars("\"abc\"")), b"\"cba");
    }

    #[test]
    fn suffix_reverses_multibyte_characters_bytewise() {
        let chars = suffix_chars(&json_quote("雨"));
        let mut expected: Vec<u8> = "雨\"".bytes().collect();
        expected.reverse();
        assert_eq!(bytes(&chars), expected);
    }

    #[test]
    fn ignore_case_folds_both_ways() {
        let chars = ignore_case_chars(&json_quote("aB"));
        assert_eq!(
            chars,
            vec![
                InputChar::Byte(b'"'),
                InputChar::MultiByte(vec![vec![b'a'], vec![b'A']]),
                InputChar::MultiByte(vec![vec![b'b'], vec![b'B']]),
                InputChar::Byte(b'"'),
            ],
        );
    }

    #[test]
    fn ignore_case_passes_caseless_bytes() {
        let chars = ignore_case_chars(&json_quote("a-1"));
        assert_eq!(chars.len(), 5);
        assert_eq!(chars[2], InputChar::Byte(b'-'));
        assert_eq!(chars[3], InputChar::Byte(b'1'));
    }

    #[test]
    fn wildcard_marks_stars() {
        let chars = wildcard_chars(&json_quote("a*b")).unwrap();
        assert_eq!(
            chars,
            vec![
                InputChar::Byte(b'"'),
                InputChar::Byte(b'a'),
                InputChar::Wildcard,
                InputChar::Byte(b'b'),
                InputChar::Byte(b'"'),
            ],
        );
    }

    #[test]
    fn wildcard_escapes_are_literal() {
        let chars = wildcard_chars(&json_quote(r"a\*b\\c")).unwrap();
        assert_eq!(bytes(&chars), b"\"a*b\\c\"");
    }

    #[test]
    fn wildcard_star_after_escaped_star_is_fine() {
        assert!(wildcard_chars(&json_quote(r"a*\**b")).is_ok());
    }

    wcerr!(wildcard_consecutive, "a**b", ErrorKind::ConsecutiveWildcards);
    wcerr!(wildcard_bad_escape, r"a\nb", ErrorKind::InvalidEscape('n'));
    wcerr!(wildcard_dangling_escape, r"ab\", ErrorKind::DanglingEscape);
}
