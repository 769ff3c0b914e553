//! Macro for string-backed configuration enums
//!
//! Generates `as_str`, `Display` and a case-insensitive `FromStr` from one
//! variant/string table, so environment values and file values parse the same
//! way.
//!
//! ```rust
//! use hidesync_domain::impl_config_enum;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum JournalMode {
//!     Delete,
//!     Wal,
//! }
//!
//! impl_config_enum!(JournalMode {
//!     Delete => "delete",
//!     Wal => "wal",
//! });
//!
//! assert_eq!("WAL".parse::<JournalMode>().unwrap(), JournalMode::Wal);
//! ```

#[macro_export]
macro_rules! impl_config_enum {
    ($enum_name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        impl $enum_name {
            /// Canonical lowercase name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }

            /// Every accepted name, in declaration order
            pub const NAMES: &'static [&'static str] = &[$($str),+];
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!(
                        "Invalid {}: '{}' (expected one of: {})",
                        stringify!($enum_name),
                        s,
                        Self::NAMES.join(", ")
                    )),
                }
            }
        }
    };
}
