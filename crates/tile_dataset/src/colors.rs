//! Class color resolution: a closed table of names plus strict `#RRGGBB`.

const NAMED: &[(&str, [u8; 3])] = &[
    ("white", [255, 255, 255]),
    ("black", [0, 0, 0]),
    ("red", [255, 0, 0]),
    ("green", [0, 128, 0]),
    ("lime", [0, 255, 0]),
    ("blue", [0, 0, 255]),
    ("yellow", [255, 255, 0]),
    ("cyan", [0, 255, 255]),
    ("aqua", [0, 255, 255]),
    ("magenta", [255, 0, 255]),
    ("fuchsia", [255, 0, 255]),
    ("orange", [255, 165, 0]),
    ("darkorange", [255, 140, 0]),
    ("pink", [255, 192, 203]),
    ("deeppink", [255, 20, 147]),
    ("purple", [128, 0, 128]),
    ("violet", [238, 130, 238]),
    ("indigo", [75, 0, 130]),
    ("brown", [165, 42, 42]),
    ("maroon", [128, 0, 0]),
    ("olive", [128, 128, 0]),
    ("navy", [0, 0, 128]),
    ("teal", [0, 128, 128]),
    ("gray", [128, 128, 128]),
    ("grey", [128, 128, 128]),
    ("silver", [192, 192, 192]),
    ("darkgray", [169, 169, 169]),
    ("lightgray", [211, 211, 211]),
    ("gold", [255, 215, 0]),
    ("darkgreen", [0, 100, 0]),
    ("forestgreen", [34, 139, 34]),
    ("skyblue", [135, 206, 235]),
    ("steelblue", [70, 130, 180]),
    ("tan", [210, 180, 140]),
    ("salmon", [250, 128, 114]),
    ("crimson", [220, 20, 60]),
];

/// Resolve a class color. Names are case-insensitive; hex must be exactly `#RRGGBB`.
pub fn parse_color(raw: &str) -> Option<[u8; 3]> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix('#') {
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        return Some([channel(0)?, channel(2)?, channel(4)?]);
    }
    let lower = raw.to_ascii_lowercase();
    NAMED
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, rgb)| *rgb)
}

pub fn to_hex(rgb: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}
