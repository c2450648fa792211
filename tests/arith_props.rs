//! Property tests for the address arithmetic helpers.

use proptest::prelude::*;

use heterokit::arith;

fn alignments() -> impl Strategy<Value = usize> {
    (0u32..20).prop_map(|shift| 1usize << shift)
}

proptest! {
    #[test]
    fn upper_align_is_aligned_and_minimal(value in 0usize..1 << 40, align in alignments()) {
        let aligned = arith::upper_align(value, align);
        prop_assert!(arith::is_aligned(aligned, align));
        prop_assert!(aligned >= value);
        prop_assert!(aligned - value < align);
    }

    #[test]
    fn lower_align_is_aligned_and_maximal(value in 0usize..1 << 40, align in alignments()) {
        let aligned = arith::lower_align(value, align);
        prop_assert!(arith::is_aligned(aligned, align));
        prop_assert!(aligned <= value);
        prop_assert!(value - aligned < align);
    }

    #[test]
    fn upper_and_lower_agree_on_aligned_values(value in 0usize..1 << 40, align in alignments()) {
        let aligned = arith::lower_align(value, align);
        prop_assert_eq!(arith::upper_align(aligned, align), aligned);
    }

    #[test]
    fn same_page_is_reflexive_and_symmetric(
        a in 0usize..1 << 40,
        b in 0usize..1 << 40,
        page in (12u32..20).prop_map(|shift| 1usize << shift),
    ) {
        prop_assert!(arith::same_page(a, a, page));
        prop_assert_eq!(arith::same_page(a, b, page), arith::same_page(b, a, page));
        // Same page implies a distance below the page alignment.
        if arith::same_page(a, b, page) {
            prop_assert!(a.abs_diff(b) < page);
        }
    }

    #[test]
    fn power_of_two_detection_matches_std(value in 0usize..1 << 48) {
        prop_assert_eq!(arith::is_power_of_two(value), value.is_power_of_two());
    }
}
