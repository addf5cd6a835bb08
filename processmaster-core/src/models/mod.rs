//! Row types for the relational schema.
//!
//! Status-like columns are stored as TEXT guarded by CHECK constraints and
//! decoded into the enums below through `#[sqlx(try_from = "String")]`.

/// A TEXT column held a value outside its enum.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a string-backed enum with `as_str`, `Display`, `FromStr` and
/// `TryFrom<String>` so it can round-trip through TEXT columns and JSON.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::models::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::models::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::models::UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

pub mod guide;
pub mod interaction;
pub mod job;
pub mod screenshot;
pub mod session;
pub mod sharing;
pub mod user;

pub use guide::{CollaboratorRole, Difficulty, Guide, GuideStatus, GuideStep, GuideSummary, Visibility};
pub use interaction::Interaction;
pub use job::{Job, JobStatus, JobType};
pub use screenshot::Screenshot;
pub use session::{CaptureSession, SessionStatus};
pub use sharing::{Collaborator, SharedLink};
pub use user::{AuthProvider, Role, User, UserProfile};
