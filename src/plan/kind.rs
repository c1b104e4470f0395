use std::str::FromStr;

/// Every plan operator the reconstruction knows how to treat. Anything else is rejected with
/// an error instead of being skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum NodeKind {
    #[strum(serialize = "Seq Scan")]
    SeqScan,
    #[strum(serialize = "Index Scan")]
    IndexScan,
    #[strum(serialize = "Index Only Scan")]
    IndexOnlyScan,
    #[strum(serialize = "Bitmap Index Scan")]
    BitmapIndexScan,
    #[strum(serialize = "Bitmap Heap Scan")]
    BitmapHeapScan,
    #[strum(serialize = "Tid Scan")]
    TidScan,
    #[strum(serialize = "Sample Scan")]
    SampleScan,

    #[strum(serialize = "Nested Loop")]
    NestedLoop,
    #[strum(serialize = "Hash Join")]
    HashJoin,
    #[strum(serialize = "Merge Join")]
    MergeJoin,

    Sort,
    Materialize,
    Hash,
    Gather,
    #[strum(serialize = "Gather Merge")]
    GatherMerge,
    Memoize,
    #[strum(serialize = "Incremental Sort")]
    IncrementalSort,

    Aggregate,
    Append,
    SetOp,
    Unique,
    WindowAgg,
    Limit,
    #[strum(serialize = "Subquery Scan")]
    SubqueryScan,
    #[strum(serialize = "CTE Scan")]
    CteScan,

    BitmapAnd,
    BitmapOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCategory {
    Scan,
    Join,
    /// Passes its only input through without changing the rows.
    Physical,
    Unsupported,
    /// Combines bitmaps for a Bitmap Heap Scan and means nothing anywhere else.
    BitmapOperand,
}

impl NodeKind {
    pub fn parse(node_type: &str) -> Option<Self> {
        Self::from_str(node_type).ok()
    }

    pub fn category(&self) -> NodeCategory {
        match self {
            Self::SeqScan
            | Self::IndexScan
            | Self::IndexOnlyScan
            | Self::BitmapIndexScan
            | Self::BitmapHeapScan
            | Self::TidScan
            | Self::SampleScan => NodeCategory::Scan,
            Self::NestedLoop | Self::HashJoin | Self::MergeJoin => NodeCategory::Join,
            Self::Sort
            | Self::Materialize
            | Self::Hash
            | Self::Gather
            | Self::GatherMerge
            | Self::Memoize
            | Self::IncrementalSort => NodeCategory::Physical,
            Self::Aggregate
            | Self::Append
            | Self::SetOp
            | Self::Unique
            | Self::WindowAgg
            | Self::Limit
            | Self::SubqueryScan
            | Self::CteScan => NodeCategory::Unsupported,
            Self::BitmapAnd | Self::BitmapOr => NodeCategory::BitmapOperand,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(NodeKind::parse("Seq Scan"), Some(NodeKind::SeqScan));
        assert_eq!(NodeKind::parse("Gather Merge"), Some(NodeKind::GatherMerge));
        assert_eq!(NodeKind::parse("CTE Scan").map(|k| k.category()), Some(NodeCategory::Unsupported));
        assert_eq!(NodeKind::parse("Hash").map(|k| k.category()), Some(NodeCategory::Physical));
        assert_eq!(NodeKind::parse("ProjectSet"), None);
        assert_eq!(NodeKind::parse("Function Scan"), None);
        assert_eq!(NodeKind::parse("Values Scan"), None);
        assert_eq!(NodeKind::BitmapOr.category(), NodeCategory::BitmapOperand);
        assert_eq!(NodeKind::HashJoin.to_string(), "Hash Join");
    }
}
