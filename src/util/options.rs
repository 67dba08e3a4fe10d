use crate::util::constants::{BYTES_IN_KBYTE, BYTES_IN_MBYTE};
use std::str::FromStr;

/// A memory size given as a plain byte count or with a binary-unit suffix,
/// e.g. `67108864`, `"512k"`, `"64m"`, `"1g"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemorySize(pub usize);

lazy_static! {
    static ref SIZE_RE: regex::Regex = regex::Regex::new(r"^(\d+)\s*([kKmMgG]?)$").unwrap();
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = SIZE_RE
            .captures(s)
            .ok_or_else(|| format!("Invalid size string: {:?}", s))?;
        let number: usize = caps[1]
            .parse()
            .map_err(|_| format!("Invalid size number: {:?}", s))?;
        let scale = match &caps[2] {
            "" => 1,
            "k" | "K" => BYTES_IN_KBYTE,
            "m" | "M" => BYTES_IN_MBYTE,
            "g" | "G" => BYTES_IN_MBYTE * 1024,
            _ => unreachable!(),
        };
        Ok(MemorySize(number * scale))
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// A quarter of physical memory, clamped to [64m, 4g]. Hosts that know their
/// heap requirements pass an explicit size instead.
fn default_heap_size() -> MemorySize {
    let total = crate::util::memory::get_system_total_memory();
    MemorySize((total / 4).clamp(64 << 20, 4 << 30) as usize)
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type [$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*) => [
        /// The typed configuration of the mark engine. Defaults can be
        /// overridden per option through environment variables with the
        /// `REGMARK_` prefix (e.g. `REGMARK_THREADS=4`), or programmatically
        /// through [`Options::set_from_str`].
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from its string name and a string value. Returns
            /// false if the name is unknown, the value fails to parse, or the
            /// value fails the option's validator.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    },)*
                    _ => {
                        eprintln!("Warn: unknown option {}.", s);
                        false
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // Environment variables that start with REGMARK_ and match an
                // option name override the default.
                const PREFIX: &str = "REGMARK_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// The number of GC worker threads.
    threads:                 usize      [|v: &usize| *v > 0] = num_cpus::get(),
    /// The size of the managed heap range.
    heap_size:               MemorySize [|v: &MemorySize| v.0 > 0] = default_heap_size(),
    /// log2 of the region size in bytes.
    region_log:              usize      [|v: &usize| (16..=28).contains(v)] = 19,
    /// Per-region cap on remembered cards before the list degrades to
    /// overflowed. 0 derives 8x the number of cards in a region.
    remset_list_max_size:    usize      [|v: &usize| *v == 0 || *v >= crate::util::constants::CARD_BUFFER_SIZE] = 0,
    /// The mark queue bound, in packets. 0 derives from the heap size.
    work_packet_count:       usize      [always_valid] = 0,
    /// Reference-array scan granule, in slots. Larger arrays are scanned in
    /// splits of this many slots.
    array_split_maximum:     usize      [|v: &usize| *v > 0] = 4096,
    /// Collections a soft reference survives before its referent stops being
    /// treated as strong.
    max_soft_reference_age:  u32        [always_valid] = 32,
    /// Whether the card scrubber runs between mark completion and the
    /// partial-collection card flush.
    card_scrubbing:          bool       [always_valid] = true,
    /// Emptiness fraction (free + dark matter over region size) below which a
    /// swept region's remembered-set list is marked stable.
    stable_region_threshold: f32        [|v: &f32| (0.0..=1.0).contains(v)] = 0.05,
}

impl Options {
    /// The region size in bytes.
    pub fn region_size(&self) -> usize {
        1 << self.region_log
    }

    /// The effective per-region remembered-set card cap.
    pub fn remset_list_max_cards(&self) -> usize {
        use crate::util::constants::LOG_BYTES_IN_CARD;
        if self.remset_list_max_size != 0 {
            self.remset_list_max_size
        } else {
            8 * (self.region_size() >> LOG_BYTES_IN_CARD)
        }
    }

    /// The effective mark queue bound in packets.
    pub fn packet_count(&self) -> usize {
        use crate::util::constants::WORK_PACKET_CAPACITY;
        if self.work_packet_count != 0 {
            self.work_packet_count
        } else {
            // One packet's worth of items per 64K of heap, at least 64 packets.
            std::cmp::max(64, self.heap_size.0 / (WORK_PACKET_CAPACITY * 128))
        }
    }
}
