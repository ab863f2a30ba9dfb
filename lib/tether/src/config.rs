//! Link configuration: a tag/value store of recognised options and its
//! typed form.

use hashbrown::HashMap;
use serde_derive::Deserialize;

/// Recognised option tags.
pub const TAG_DRIVER_NAME: &str = "driver_name";
pub const TAG_DRIVER_PORT: &str = "driver_port";
pub const TAG_DRIVER_BAUD: &str = "driver_baud";
pub const TAG_DRIVER_OPTIONS: &str = "driver_options";
pub const TAG_AUTO_BAUD: &str = "auto_baud";
pub const TAG_IDLE_DISCONNECT_LINK: &str = "idle_disconnect_link";
pub const TAG_MTU: &str = "mtu";
pub const TAG_MAX_WINDOW: &str = "max_window";

/// Typed link options.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkOptions {
    /// Name of the serial block driver to use.
    pub driver_name: String,
    /// Port number within the driver.
    pub driver_port: u32,
    /// Initial baud rate.
    pub driver_baud: u32,
    /// Driver specific option string.
    pub driver_options: String,
    /// Cycle through baud rates while establishing a connection.
    pub auto_baud: bool,
    /// Centiseconds of inactivity after which the link drops; 0 disables
    /// the idle disconnect.
    pub idle_disconnect_link: u32,
    /// Default per-channel message size before fragmentation.
    pub mtu: u32,
    /// Era transmit window; clamped to 1..=32. Sibo always uses 1.
    pub max_window: u32,
}

impl Default for LinkOptions {
    fn default() -> LinkOptions {
        LinkOptions {
            driver_name: String::from("internal"),
            driver_port: 0,
            driver_baud: 115_200,
            driver_options: String::new(),
            auto_baud: true,
            idle_disconnect_link: 6000,
            mtu: 2048,
            max_window: 5,
        }
    }
}

impl LinkOptions {
    /// Load options from a TOML document.
    pub fn from_toml(toml: &str) -> Result<LinkOptions, String> {
        let options: LinkOptions = serdeconv::from_toml_str(toml).map_err(|e| e.to_string())?;
        Ok(options.normalised())
    }

    /// Build typed options from a tag/value store. Unrecognised or
    /// malformed values fall back to the defaults.
    pub fn from_store(store: &OptionStore) -> LinkOptions {
        let defaults = LinkOptions::default();
        LinkOptions {
            driver_name: store
                .get(TAG_DRIVER_NAME)
                .map(str::to_string)
                .unwrap_or(defaults.driver_name),
            driver_port: store.get_parsed(TAG_DRIVER_PORT).unwrap_or(defaults.driver_port),
            driver_baud: store.get_parsed(TAG_DRIVER_BAUD).unwrap_or(defaults.driver_baud),
            driver_options: store
                .get(TAG_DRIVER_OPTIONS)
                .map(str::to_string)
                .unwrap_or(defaults.driver_options),
            auto_baud: store.get_parsed(TAG_AUTO_BAUD).unwrap_or(defaults.auto_baud),
            idle_disconnect_link: store
                .get_parsed(TAG_IDLE_DISCONNECT_LINK)
                .unwrap_or(defaults.idle_disconnect_link),
            mtu: store.get_parsed(TAG_MTU).unwrap_or(defaults.mtu),
            max_window: store.get_parsed(TAG_MAX_WINDOW).unwrap_or(defaults.max_window),
        }
        .normalised()
    }

    fn normalised(mut self) -> LinkOptions {
        if self.max_window < 1 {
            self.max_window = 1;
        } else if self.max_window > 32 {
            self.max_window = 32;
        }
        if self.mtu == 0 {
            self.mtu = LinkOptions::default().mtu;
        }
        self
    }
}

/// Flat tag/value option store. Tags are case sensitive; unknown tags are
/// retained so an embedder can round-trip settings it does not understand.
#[derive(Debug, Default, Clone)]
pub struct OptionStore {
    values: HashMap<String, String>,
}

impl OptionStore {
    pub fn new() -> OptionStore {
        OptionStore::default()
    }

    /// Parse `tag=value` lines. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> OptionStore {
        let mut store = OptionStore::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(split) = line.find('=') {
                let (tag, value) = line.split_at(split);
                store.set(tag.trim(), value[1..].trim());
            }
        }
        store
    }

    #[inline]
    pub fn set(&mut self, tag: &str, value: &str) {
        self.values.insert(tag.to_string(), value.to_string());
    }

    #[inline]
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.values.get(tag).map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    fn get_parsed<T: std::str::FromStr>(&self, tag: &str) -> Option<T> {
        self.get(tag).and_then(|value| value.parse().ok())
    }
}
