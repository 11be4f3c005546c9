//! Property tests for partition planning and slicing
//!
//! - Tiling: partitions cover `[0, L)` with no gaps or overlaps
//! - Size bound: every partition fits the planned length
//! - Slicing: a slice iterates exactly `min(limit, L - offset)` elements

use proptest::prelude::*;

mod planning {
    use super::*;
    use brokermr::coordinator::{partition_length, plan_partitions, PartitionStrategy};

    fn strategy() -> impl Strategy<Value = PartitionStrategy> {
        prop_oneof![
            Just(PartitionStrategy::FloorPlusOne),
            Just(PartitionStrategy::ExactCeil),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: Partitions tile the dataset in emission order
        #[test]
        fn prop_partitions_tile_dataset(
            length in 1u64..100_000,
            workers in 1u32..256,
            strategy in strategy(),
        ) {
            let plan = plan_partitions(length, workers, strategy).unwrap();

            let mut next = 0;
            for partition in &plan {
                prop_assert_eq!(partition.offset, next);
                prop_assert!(partition.limit > 0);
                next = partition.end();
            }
            prop_assert_eq!(next, length);
        }

        /// Property: Only the last partition may be shorter
        #[test]
        fn prop_partition_sizes_are_bounded(
            length in 1u64..100_000,
            workers in 1u32..256,
        ) {
            let size = partition_length(length, workers, PartitionStrategy::FloorPlusOne).unwrap();
            prop_assert_eq!(size, length / u64::from(workers) + 1);

            let plan = plan_partitions(length, workers, PartitionStrategy::FloorPlusOne).unwrap();
            let (last, rest) = plan.split_last().unwrap();
            prop_assert!(rest.iter().all(|p| p.limit == size));
            prop_assert!(last.limit <= size);
            prop_assert!(plan.len() as u64 <= u64::from(workers));
        }

        /// Property: Exact ceiling never produces more than W partitions
        #[test]
        fn prop_exact_ceil_uses_at_most_w(
            length in 1u64..100_000,
            workers in 1u32..256,
        ) {
            let plan = plan_partitions(length, workers, PartitionStrategy::ExactCeil).unwrap();
            prop_assert!(plan.len() as u64 <= u64::from(workers));
        }
    }
}

mod slicing {
    use super::*;
    use brokermr::source::{ArithmeticSpec, SourceFactory, SourceSpec};
    use serde_json::Value;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: A derived slice iterates positions [a, min(a + b, L))
        #[test]
        fn prop_derived_slice_covers_requested_range(
            length in 1u64..500,
            offset_ratio in 0.0f64..=1.0,
            limit in 0u64..600,
        ) {
            let offset = (length as f64 * offset_ratio) as u64;
            let spec = ArithmeticSpec::integers(length);
            let factory = SourceFactory::derived(SourceSpec::Arithmetic(spec));
            let slice = factory.slice(offset, limit).unwrap();

            let source = tokio_test::block_on(slice.build()).unwrap();
            let values: Vec<Value> = source
                .iterate(slice.partition().unwrap())
                .map(|r| r.value)
                .collect();

            let end = (offset + limit).min(length);
            let expected: Vec<Value> = (offset..end).map(Value::from).collect();
            prop_assert_eq!(values, expected);
        }

        /// Property: An inline slice keeps the original positions as keys
        #[test]
        fn prop_inline_slice_keeps_positions(
            length in 1u64..300,
            offset_ratio in 0.0f64..1.0,
            limit in 1u64..300,
        ) {
            let offset = (length as f64 * offset_ratio) as u64;
            let factory = SourceFactory::inline((0..length).map(Value::from));
            let slice = factory.slice(offset, limit).unwrap();

            let source = tokio_test::block_on(slice.build()).unwrap();
            let keys: Vec<Value> = source
                .iterate(slice.partition().unwrap())
                .map(|r| r.key)
                .collect();

            let end = (offset + limit).min(length);
            prop_assert_eq!(keys, (offset..end).map(Value::from).collect::<Vec<_>>());
        }
    }
}
