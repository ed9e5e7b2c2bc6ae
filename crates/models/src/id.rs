/// Id is an opaque identifier for a server-side row: a record, molecule,
/// specification, manager, and so on. Ids are assigned by the datastore and
/// are monotone within a table, but callers must not read meaning into them.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx-support", sqlx(transparent))]
pub struct Id(pub i64);

impl Id {
    pub const ZERO: Id = Id(0);

    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for Id {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl std::str::FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Id(s.parse()?))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Id(i64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::Id;

    #[test]
    fn id_round_trips_through_serde_and_str() {
        let id = Id(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(serde_json::from_str::<Id>("42").unwrap(), id);
        assert_eq!("42".parse::<Id>().unwrap(), id);
        assert_eq!(id.to_string(), "42");
    }
}
