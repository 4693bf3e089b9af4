use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    pub fn is_to_one(&self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToOne)
    }

    pub fn is_to_many(&self) -> bool {
        !self.is_to_one()
    }
}

/// Relationship kind reported by the dictionary. Unknown fields are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    None,
    Persisted(Cardinality),
    /// Virtual relationship, never persisted by the backend.
    Computed(Cardinality),
}

impl RelationshipType {
    pub fn cardinality(&self) -> Option<Cardinality> {
        match self {
            Self::None => None,
            Self::Persisted(c) | Self::Computed(c) => Some(*c),
        }
    }

    pub fn is_relationship(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn is_to_one(&self) -> bool {
        self.cardinality().is_some_and(|c| c.is_to_one())
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality().is_some_and(|c| c.is_to_many())
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed(_))
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.cardinality() {
            None => return write!(f, "NONE"),
            Some(Cardinality::OneToOne) => "ONE_TO_ONE",
            Some(Cardinality::OneToMany) => "ONE_TO_MANY",
            Some(Cardinality::ManyToOne) => "MANY_TO_ONE",
            Some(Cardinality::ManyToMany) => "MANY_TO_MANY",
        };
        if self.is_computed() {
            write!(f, "COMPUTED_{}", name)
        } else {
            write!(f, "{}", name)
        }
    }
}
