/*!
Разбор IP-адресов и CIDR-блоков.

Адрес разворачивается в шестнадцатеричную форму фиксированной ширины
(8 цифр для IPv4, 32 для IPv6, верхний регистр), так что блок CIDR
превращается в диапазон по тем же правилам, что и числовой диапазон:
младшие биты обнуляются для нижней границы и выставляются в единицы
для верхней.
*/

use crate::{Error, ErrorKind, pattern::ValueRange};

/// Разбирает IP-литерал или CIDR-блок в диапазон шестнадцатеричных строк.
///
/// Голый адрес превращается в полуоткрытый диапазон `[addr, addr+1)`,
/// так что ему соответствует ровно один адрес.
pub(crate) fn parse_cidr(text: &str) -> Result<ValueRange, Error> {
    let err = || Error::new(ErrorKind::MalformedCidr(text.to_string()));
    let (addr, prefix) = match text.split_once('/') {
        None => (text, None),
        Some((addr, prefix)) => {
            let prefix = prefix.parse::<u32>().map_err(|_| err())?;
            (addr, Some(prefix))
        }
    };
    if let Some(v4) = parse_ipv4(addr) {
        let width = 32;
        match prefix {
            None => Ok(single(u128::from(v4), width)),
            Some(p) if p <= width => {
                let (floor, ceiling) = block(u128::from(v4), width, p);
                Ok(ValueRange::cidr_block(
                    hex_digits(floor, width),
                    hex_digits(ceiling, width),
                ))
            }
            Some(_) => Err(err()),
        }
    } else if let Some(v6) = parse_ipv6(addr) {
        let width = 128;
        match prefix {
            None => Ok(single(v6, width)),
            Some(p) if p <= width => {
                let (floor, ceiling) = block(v6, width, p);
                Ok(ValueRange::cidr_block(
                    hex_digits(floor, width),
                    hex_digits(ceiling, width),
                ))
            }
            Some(_) => Err(err()),
        }
    } else {
        Err(err())
    }
}

/// Возвращает шестнадцатеричную форму голого IP-литерала, если строка
/// является таковым. Используется при сопоставлении значений событий
/// с CIDR-диапазонами.
pub(crate) fn parse_ip_literal(text: &str) -> Option<String> {
    if let Some(v4) = parse_ipv4(text) {
        Some(hex_digits(u128::from(v4), 32))
    } else {
        parse_ipv6(text).map(|v6| hex_digits(v6, 128))
    }
}

fn single(addr: u128, width: u32) -> ValueRange {
    let max = max_addr(width);
    if addr == max {
        // No successor; a closed one-point range means the same thing.
        ValueRange::cidr_block(hex_digits(addr, width), hex_digits(addr, width))
    } else {
        ValueRange::cidr_half_open(
            hex_digits(addr, width),
            hex_digits(addr + 1, width),
        )
    }
}

fn block(addr: u128, width: u32, prefix: u32) -> (u128, u128) {
    let mask = if prefix == 0 {
        0
    } else {
        (max_addr(width) >> (width - prefix)) << (width - prefix)
    };
    (addr & mask, (addr & mask) | (max_addr(width) & !mask))
}

fn max_addr(width: u32) -> u128 {
    if width == 128 { u128::MAX } else { (1u128 << width) - 1 }
}

fn hex_digits(addr: u128, width: u32) -> String {
    format!("{:0digits$X}", addr, digits = (width / 4) as usize)
}

fn parse_ipv4(text: &str) -> Option<u32> {
    let mut addr = 0u32;
    let mut octets = 0;
    for part in text.split('.') {
        if part.is_empty()
            || part.len() > 3
            || !part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let octet = part.parse::<u32>().ok()?;
        if octet > 255 {
            return None;
        }
        addr = (addr << 8) | octet;
        octets += 1;
    }
    if octets == 4 { Some(addr) } else { None }
}

fn parse_ipv6(text: &str) -> Option<u128> {
    // Either eight colon-separated groups, or fewer with a single "::"
    // standing for the missing zero groups.
    let (head, tail) = match text.split_once("::") {
        None => (text, None),
        Some((head, tail)) => (head, Some(tail)),
    };
    let head_groups = parse_groups(head)?;
    match tail {
        None => {
            if head_groups.len() != 8 {
                return None;
            }
            Some(groups_to_addr(&head_groups))
        }
        Some(tail) => {
            if tail.contains("::") {
                return None;
            }
            let tail_groups = parse_groups(tail)?;
            if head_groups.len() + tail_groups.len() > 7 {
                return None;
            }
            let mut groups = head_groups;
            groups.resize(8 - tail_groups.len(), 0);
            groups.extend_from_slice(&tail_groups);
            Some(groups_to_addr(&groups))
        }
    }
}

fn parse_groups(text: &str) -> Option<Vec<u16>> {
    if text.is_empty() {
        return Some(vec![]);
    }
    let mut groups = vec![];
    for part in text.split(':') {
        if part.is_empty()
            || part.len() > 4
            || !part.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return None;
        }
        groups.push(u16::from_str_radix(part, 16).ok()?);
        if groups.len() > 8 {
            return None;
        }
    }
    Some(groups)
}

fn groups_to_addr(groups: &[u16]) -> u128 {
    groups.iter().fold(0u128, |addr, &g| (addr << 16) | u128::from(g))
}

#[cfg(test)]
mod tests {
    use super::{parse_cidr, parse_ip_literal};
    use crate::ErrorKind;

    macro_rules! badcidr {
        ($name:ident, $text:expr) => {
            #[test]
            fn $name() {
                let err = parse_cidr($text).unwrap_err();
                assert!(matches!(err.kind(), ErrorKind::MalformedCidr(_)));
            }
        };
    }

    #[test]
    fn ipv4_literal() {
        assert_eq!(
            parse_ip_literal("10.0.0.1").as_deref(),
            Some("0A000001"),
        );
        assert_eq!(
            parse_ip_literal("255.255.255.255").as_deref(),
            Some("FFFFFFFF"),
        );
    }

    #[test]
    fn ipv6_literal() {
        assert_eq!(
            parse_ip_literal("::1").as_deref(),
            Some("00000000000000000000000000000001"),
        );
        assert_eq!(
            parse_ip_literal("2001:db8::ff00:42:8329").as_deref(),
            Some("20010DB8000000000000FF0000428329"),
        );
    }

    #[test]
    fn ipv4_block_bounds() {
        let range = parse_cidr("10.0.0.0/24").unwrap();
        assert_eq!(range.bottom(), b"0A000000");
        assert_eq!(range.top(), b"0A0000FF");
        assert!(!range.open_bottom() && !range.open_top());
    }

    #[test]
    fn ipv4_bare_address_is_half_open() {
        let range = parse_cidr("10.0.0.5").unwrap();
        assert_eq!(range.bottom(), b"0A000005");
        assert_eq!(range.top(), b"0A000006");
        assert!(!range.open_bottom() && range.open_top());
    }

    #[test]
    fn ipv4_full_prefix_is_one_point() {
        let range = parse_cidr("10.1.2.3/32").unwrap();
        assert_eq!(range.bottom(), range.top());
    }

    #[test]
    fn ipv6_block_bounds() {
        let range = parse_cidr("2001:db8::/32").unwrap();
        assert_eq!(range.bottom(), b"20010DB8000000000000000000000000");
        assert_eq!(range.top(), b"20010DB8FFFFFFFFFFFFFFFFFFFFFFFF");
    }

    badcidr!(bad_octet_count, "10.0.0");
    badcidr!(bad_octet_value, "10.0.0.256");
    badcidr!(bad_octet_text, "10.0.0.x");
    badcidr!(bad_prefix_width, "10.0.0.0/33");
    badcidr!(bad_prefix_text, "10.0.0.0/abc");
    badcidr!(bad_double_compression, "1::2::3");
    badcidr!(bad_group_count, "1:2:3:4:5:6:7:8:9");
    badcidr!(bad_empty, "");
}
