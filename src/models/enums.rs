use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

// Declaration order is workflow order; `Ord` relies on it.
str_enum!(StageKind {
    Assessment => "assessment",
    Authorization => "authorization",
    ProcedureExecution => "procedure_execution",
    FollowUp => "follow_up",
});

str_enum!(NextAction {
    EvaluateCase => "evaluate_case",
    Authorize => "authorize",
    RecordProcedure => "record_procedure",
    RecordFollowUp => "record_follow_up",
    Complete => "complete",
});

impl StageKind {
    /// All stages in workflow order.
    pub const ORDER: [StageKind; 4] = [
        StageKind::Assessment,
        StageKind::Authorization,
        StageKind::ProcedureExecution,
        StageKind::FollowUp,
    ];

    /// Table holding this stage's records.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Assessment => "stage_assessment",
            Self::Authorization => "stage_authorization",
            Self::ProcedureExecution => "stage_procedure_execution",
            Self::FollowUp => "stage_follow_up",
        }
    }

    /// The action a user takes to complete this stage.
    pub fn action(&self) -> NextAction {
        match self {
            Self::Assessment => NextAction::EvaluateCase,
            Self::Authorization => NextAction::Authorize,
            Self::ProcedureExecution => NextAction::RecordProcedure,
            Self::FollowUp => NextAction::RecordFollowUp,
        }
    }
}
