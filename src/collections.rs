use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionKind {
    Timetable,
    Subjects,
    Techniques,
    Exercises,
    DayTable,
    Diet,
    Goals,
    Remember,
    Tasks,
    SdDefinitions,
    SdPhaseDefinitions,
    SdPhaseTools,
    SdPhaseSteps,
    Projects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSpec {
    pub kind: CollectionKind,
    pub table: &'static str,
    pub partition_column: Option<&'static str>,
    pub required_fields: &'static [&'static str],
}

impl CollectionSpec {
    pub fn is_partitioned(&self) -> bool {
        self.partition_column.is_some()
    }
}

pub const CATALOG: &[CollectionSpec] = &[
    CollectionSpec {
        kind: CollectionKind::Timetable,
        table: "timetable_entries",
        partition_column: Some("day"),
        required_fields: &["subject"],
    },
    CollectionSpec {
        kind: CollectionKind::Subjects,
        table: "subjects",
        partition_column: None,
        required_fields: &["name"],
    },
    CollectionSpec {
        kind: CollectionKind::Techniques,
        table: "mind_body_techniques",
        partition_column: Some("section_name"),
        required_fields: &["name"],
    },
    CollectionSpec {
        kind: CollectionKind::Exercises,
        table: "exercises",
        partition_column: Some("section_name"),
        required_fields: &["name"],
    },
    CollectionSpec {
        kind: CollectionKind::DayTable,
        table: "day_table_rows",
        partition_column: Some("day"),
        required_fields: &["activity"],
    },
    CollectionSpec {
        kind: CollectionKind::Diet,
        table: "diet_items",
        partition_column: Some("section_name"),
        required_fields: &["food"],
    },
    CollectionSpec {
        kind: CollectionKind::Goals,
        table: "goals",
        partition_column: Some("section_name"),
        required_fields: &["goal"],
    },
    CollectionSpec {
        kind: CollectionKind::Remember,
        table: "remember_items",
        partition_column: None,
        required_fields: &["text"],
    },
    CollectionSpec {
        kind: CollectionKind::Tasks,
        table: "tasks",
        partition_column: Some("section_name"),
        required_fields: &["task"],
    },
    CollectionSpec {
        kind: CollectionKind::SdDefinitions,
        table: "sd_definitions",
        partition_column: None,
        required_fields: &["name"],
    },
    CollectionSpec {
        kind: CollectionKind::SdPhaseDefinitions,
        table: "sd_phase_definitions",
        partition_column: Some("definition_id"),
        required_fields: &["name"],
    },
    CollectionSpec {
        kind: CollectionKind::SdPhaseTools,
        table: "sd_phase_tools",
        partition_column: Some("phase_id"),
        required_fields: &["tool"],
    },
    CollectionSpec {
        kind: CollectionKind::SdPhaseSteps,
        table: "sd_phase_steps",
        partition_column: Some("phase_id"),
        required_fields: &["step"],
    },
    CollectionSpec {
        kind: CollectionKind::Projects,
        table: "projects",
        partition_column: None,
        required_fields: &["name"],
    },
];

impl CollectionKind {
    pub fn spec(self) -> &'static CollectionSpec {
        CATALOG
            .iter()
            .find(|spec| spec.kind == self)
            .unwrap_or_else(|| unreachable!("every collection kind has a catalog entry"))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timetable => "timetable",
            Self::Subjects => "subjects",
            Self::Techniques => "techniques",
            Self::Exercises => "exercises",
            Self::DayTable => "day-table",
            Self::Diet => "diet",
            Self::Goals => "goals",
            Self::Remember => "remember",
            Self::Tasks => "tasks",
            Self::SdDefinitions => "sd-definitions",
            Self::SdPhaseDefinitions => "sd-phase-definitions",
            Self::SdPhaseTools => "sd-phase-tools",
            Self::SdPhaseSteps => "sd-phase-steps",
            Self::Projects => "projects",
        }
    }
}
