/// Android `KEYCODE_*` value for a key name, or `None` for anything outside
/// the closed set. Single characters map to their SDK keycodes; named keys
/// use the lower-cased scrcpy naming.
pub fn keycode(name: &str) -> Option<u32> {
    let code = match name {
        "0" => 7,
        "1" => 8,
        "2" => 9,
        "3" => 10,
        "4" => 11,
        "5" => 12,
        "6" => 13,
        "7" => 14,
        "8" => 15,
        "9" => 16,
        "a" => 29,
        "b" => 30,
        "c" => 31,
        "d" => 32,
        "e" => 33,
        "f" => 34,
        "g" => 35,
        "h" => 36,
        "i" => 37,
        "j" => 38,
        "k" => 39,
        "l" => 40,
        "m" => 41,
        "n" => 42,
        "o" => 43,
        "p" => 44,
        "q" => 45,
        "r" => 46,
        "s" => 47,
        "t" => 48,
        "u" => 49,
        "v" => 50,
        "w" => 51,
        "x" => 52,
        "y" => 53,
        "z" => 54,
        " " => 62,
        "#" => 18,
        "'" => 75,
        "(" => 162,
        ")" => 163,
        "*" => 17,
        "+" => 81,
        "," => 55,
        "-" => 69,
        "." => 56,
        "/" => 76,
        ";" => 74,
        "=" => 70,
        "@" => 77,
        "[" => 71,
        "\\" => 73,
        "]" => 72,
        "`" => 68,
        "\n" => 66,
        "\t" => 61,
        "home" => 3,
        "back" => 4,
        "up" => 19,
        "down" => 20,
        "left" => 21,
        "right" => 22,
        "volumeup" => 24,
        "volumedown" => 25,
        "power" => 26,
        "backspace" => 67,
        "menu" => 82,
        "mediaplaypause" => 85,
        "mediastop" => 86,
        "medianext" => 87,
        "mediaprevious" => 88,
        "pageup" => 92,
        "pagedown" => 93,
        "escape" => 111,
        "delete" => 112,
        "movehome" => 122,
        "moveend" => 123,
        "insert" => 124,
        "numpad0" => 144,
        "numpad1" => 145,
        "numpad2" => 146,
        "numpad3" => 147,
        "numpad4" => 148,
        "numpad5" => 149,
        "numpad6" => 150,
        "numpad7" => 151,
        "numpad8" => 152,
        "numpad9" => 153,
        "numpaddivide" => 154,
        "numpadmultiply" => 155,
        "numpadsubtract" => 156,
        "numpadadd" => 157,
        "numpaddot" => 158,
        "numpadenter" => 160,
        "numpadequals" => 161,
        "appswitch" => 187,
        "assist" => 219,
        "brightnessdown" => 220,
        "brightnessup" => 221,
        "sleep" => 223,
        "wakeup" => 224,
        "voiceassist" => 231,
        "allapps" => 284,
        _ => return None,
    };

    Some(code)
}
