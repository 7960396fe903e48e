use crate::datasource::JoinStats;
use crate::model::Cardinality;

/// Cardinality implied by join statistics, read from the source side.
///
/// A side is unique when its distinct values cover its non-null rows.
/// Without row counts on both sides nothing can be said.
pub fn infer_from_stats(stats: &JoinStats) -> Cardinality {
    if stats.source_rows <= 0 || stats.target_rows <= 0 {
        return Cardinality::Unknown;
    }
    let source_unique = stats.source_distinct >= stats.source_rows;
    let target_unique = stats.target_distinct >= stats.target_rows;
    match (source_unique, target_unique) {
        (false, true) => Cardinality::ManyToOne,
        (true, true) => Cardinality::OneToOne,
        (true, false) => Cardinality::OneToMany,
        (false, false) => Cardinality::ManyToMany,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(source_distinct: i64, source_rows: i64, target_distinct: i64, target_rows: i64) -> JoinStats {
        JoinStats {
            source_distinct,
            source_rows,
            target_distinct,
            target_rows,
            ..Default::default()
        }
    }

    #[test]
    fn orders_to_customers_is_many_to_one() {
        // 5 orders over 3 customers, every customer id unique
        assert_eq!(infer_from_stats(&stats(3, 5, 3, 3)), Cardinality::ManyToOne);
    }

    #[test]
    fn uniqueness_matrix() {
        assert_eq!(infer_from_stats(&stats(4, 4, 4, 4)), Cardinality::OneToOne);
        assert_eq!(infer_from_stats(&stats(4, 4, 2, 4)), Cardinality::OneToMany);
        assert_eq!(infer_from_stats(&stats(2, 4, 2, 4)), Cardinality::ManyToMany);
    }

    #[test]
    fn missing_row_counts_are_unknown() {
        assert_eq!(infer_from_stats(&stats(3, 0, 3, 3)), Cardinality::Unknown);
        assert_eq!(infer_from_stats(&JoinStats::default()), Cardinality::Unknown);
    }
}
