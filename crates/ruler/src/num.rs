/*!
Каноническое представление чисел.

Число из окна ±5·10⁹ кодируется строкой из 14 шестнадцатеричных цифр в
верхнем регистре так, что числовой порядок совпадает с лексикографическим
порядком байтов. Это позволяет байтовому автомату сравнивать числа и
диапазоны тем же механизмом, что и строки.
*/

use crate::{Error, ErrorKind};

/// Максимальная величина числа, допустимая в правилах и событиях.
pub(crate) const MAX_NUM_MAGNITUDE: f64 = 5.0e9;

/// Количество шестнадцатеричных цифр канонической формы.
///
/// (5e9 + 5e9) * 1e6 < 2^54, так что 14 цифр достаточно.
pub(crate) const CANONICAL_DIGITS: usize = 14;

// Six decimal digits of precision, same window the f64 arithmetic below
// preserves across the whole ±5e9 range.
const PRECISION: f64 = 1.0e6;

/// Возвращает каноническую форму данного числа.
///
/// Два числа, совпадающие с точностью до шести десятичных знаков,
/// получают одинаковую форму: `300`, `300.0000` и `3.0e+2` кодируются
/// одной и той же строкой. Числа вне окна ±5·10⁹ отвергаются.
pub(crate) fn canonicalize(value: f64) -> Result<String, Error> {
    if !value.is_finite()
        || value < -MAX_NUM_MAGNITUDE
        || value > MAX_NUM_MAGNITUDE
    {
        return Err(Error::new(ErrorKind::NumericRangeExceeded(
            value.to_string(),
        )));
    }
    let shifted = ((value + MAX_NUM_MAGNITUDE) * PRECISION).round() as u64;
    Ok(format!("{:014X}", shifted))
}

#[cfg(test)]
mod tests {
    use super::{CANONICAL_DIGITS, canonicalize};
    use crate::ErrorKind;

    macro_rules! ordered {
        ($name:ident, $a:expr, $b:expr) => {
            #[test]
            fn $name() {
                let a = canonicalize($a).unwrap();
                let b = canonicalize($b).unwrap();
                assert!(a < b, "{} => {}, {} => {}", $a, a, $b, b);
            }
        };
    }

    macro_rules! same {
        ($name:ident, $a:expr, $b:expr) => {
            #[test]
            fn $name() {
                assert_eq!(
                    canonicalize($a).unwrap(),
                    canonicalize($b).unwrap(),
                );
            }
        };
    }

    ordered!(order_small, 1.0, 2.0);
    ordered!(order_negative, -2.0, -1.0);
    ordered!(order_across_zero, -0.000001, 0.000001);
    ordered!(order_fraction, 5.0, 5.000001);
    ordered!(order_extremes, -5.0e9, 5.0e9);

    same!(collapse_trailing_zeros, 300.0, 300.0000);
    same!(collapse_exponent, 300.0, 3.0e+2);
    same!(collapse_below_precision, 1.0, 1.0000000001);
    same!(collapse_negative_zero, -0.0, 0.0);

    #[test]
    fn fixed_width() {
        for v in [-5.0e9, -1.0, 0.0, 1.5, 5.0e9] {
            assert_eq!(canonicalize(v).unwrap().len(), CANONICAL_DIGITS);
        }
    }

    #[test]
    fn boundary_accepted() {
        assert!(canonicalize(5.0e9).is_ok());
        assert!(canonicalize(-5.0e9).is_ok());
    }

    #[test]
    fn beyond_boundary_rejected() {
        for v in [5.000000001e9, -5.000000001e9, f64::INFINITY, f64::NAN] {
            let err = canonicalize(v).unwrap_err();
            assert!(matches!(
                err.kind(),
                ErrorKind::NumericRangeExceeded(_)
            ));
        }
    }

    #[test]
    fn hex_is_upper_case() {
        let canon = canonicalize(5.0e9).unwrap();
        assert!(canon.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_uppercase()));
    }
}
