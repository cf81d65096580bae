/// A row of the `locations` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub area: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A location that has not been assigned a surrogate key yet.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewLocation {
    pub name: String,
    pub area: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NewLocation {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            area: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_id(self, id: i64) -> Location {
        Location {
            id,
            name: self.name,
            area: self.area,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}
