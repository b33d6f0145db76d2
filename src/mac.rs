/*!
 # MAC address normalization

 Addresses typed by users and addresses reported by the Bluetooth stack come in
 several shapes. Config entries and the "already configured" check both compare
 the normalized form produced here.
*/

/// Formats a MAC address as lowercase, colon separated hex pairs
///
/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF`, `AABB.CCDD.EEFF` and
/// `AABBCCDDEEFF`. Anything else, including any non-ASCII input, is returned
/// unchanged.
pub fn format_mac(mac: &str) -> String {
    // Length checks below count bytes
    if !mac.is_ascii() {
        return mac.to_string();
    }

    if mac.len() == 17 && separator_count(mac, ':') == 5 {
        return mac.to_lowercase();
    }

    let stripped = if mac.len() == 17 && separator_count(mac, '-') == 5 {
        mac.replace('-', "")
    } else if mac.len() == 14 && separator_count(mac, '.') == 2 {
        mac.replace('.', "")
    } else if mac.len() == 12 && mac.chars().all(|c| c.is_ascii_hexdigit()) {
        mac.to_string()
    } else {
        return mac.to_string();
    };

    stripped
        .to_lowercase()
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(":")
}

fn separator_count(mac: &str, separator: char) -> usize {
    mac.chars().filter(|c| *c == separator).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colon_form_is_lowercased() {
        assert_eq!(format_mac("AA:BB:CC:DD:EE:01"), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_dash_and_dot_forms() {
        assert_eq!(format_mac("AA-BB-CC-DD-EE-01"), "aa:bb:cc:dd:ee:01");
        assert_eq!(format_mac("AABB.CCDD.EE01"), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_bare_hex() {
        assert_eq!(format_mac("AABBCCDDEE01"), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_unknown_format_is_unchanged() {
        assert_eq!(format_mac("not-a-mac"), "not-a-mac");
        assert_eq!(format_mac("AABBCCDDEEZZ"), "AABBCCDDEEZZ");
        assert_eq!(format_mac(""), "");
        assert_eq!(format_mac("AA-BB-CC-DD-E-éF"), "AA-BB-CC-DD-E-éF");
        assert_eq!(format_mac("AA:BB:CC:DD:E:é"), "AA:BB:CC:DD:E:é");
        assert_eq!(format_mac("AABBCCDDEEé"), "AABBCCDDEEé");
    }
}
