//! Macros for defining typed ID types.

/// Macro to define a typed ID over a fixed-length lowercase hex string.
///
/// This generates a newtype with:
/// - A `LEN` constant (number of hex characters)
/// - `generate()` to mint a fresh ID from a caller-supplied RNG
/// - `parse()` to parse from string with strict validation
/// - `short()` returning the leading eight characters (the portion host
///   resource names are derived from)
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_id!(InstanceId, 24);
///
/// let id = InstanceId::generate(&mut rand::rng());
/// let parsed: InstanceId = "9f8a3c21d4e5b6a7f0c1d2e3".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $len:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Number of hex characters in the canonical form.
            pub const LEN: usize = $len;

            /// Mints a fresh ID from the given RNG.
            ///
            /// The RNG is caller-supplied so that tests can seed it.
            #[must_use]
            pub fn generate<R: rand::Rng + ?Sized>(rng: &mut R) -> Self {
                const HEX: &[u8; 16] = b"0123456789abcdef";
                let mut s = String::with_capacity(Self::LEN);
                for _ in 0..Self::LEN {
                    s.push(HEX[rng.random_range(0..16)] as char);
                }
                Self(s)
            }

            /// Parses an ID from a string.
            ///
            /// The string must be exactly `LEN` lowercase hex characters.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                if s.len() != Self::LEN {
                    return Err($crate::IdError::InvalidLength {
                        expected: Self::LEN,
                        actual: s.len(),
                    });
                }
                for (position, ch) in s.char_indices() {
                    if !matches!(ch, '0'..='9' | 'a'..='f') {
                        return Err($crate::IdError::InvalidCharacter { ch, position });
                    }
                }
                Ok(Self(s.to_string()))
            }

            /// Returns the canonical string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the leading eight characters of the ID.
            ///
            /// Host-side resource names (TAP devices, traffic classes) are
            /// derived from this slice, so it must stay stable.
            #[must_use]
            pub fn short(&self) -> &str {
                &self.0[..8]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
