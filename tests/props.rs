use proptest::prelude::*;

use forthright::{
    leakbox::{LBForth, Params},
    shared::Shared,
    Cell, Error,
};

fn lbforth() -> LBForth<()> {
    LBForth::from_params(Params::default(), ())
}

fn stack_of(lb: &LBForth<()>) -> Vec<Cell> {
    lb.forth.data_stack.iter().collect()
}

proptest! {
    #[test]
    fn literal_roundtrip(n: i32) {
        let mut lb = lbforth();
        lb.forth.exec(&n.to_string()).unwrap();
        prop_assert_eq!(stack_of(&lb), vec![n as Cell]);
    }

    #[test]
    fn compiled_matches_interpreted(
        ns in proptest::collection::vec(-1000 as Cell..1000, 1..8)
    ) {
        let mut body = String::new();
        for (i, n) in ns.iter().enumerate() {
            body.push_str(&n.to_string());
            body.push(' ');
            if i > 0 {
                body.push_str("+ ");
            }
        }

        let mut interp = lbforth();
        interp.forth.exec(&body).unwrap();

        let mut comp = lbforth();
        comp.forth.exec(&format!(": w {body} ; w")).unwrap();

        prop_assert_eq!(stack_of(&interp), stack_of(&comp));
        prop_assert_eq!(stack_of(&comp), vec![ns.iter().sum::<Cell>()]);
    }

    #[test]
    fn here_never_decreases(
        scripts in proptest::collection::vec(
            prop::sample::select(vec![
                "1 2 +",
                ": q 1 ;",
                "4 ,",
                ": p { a b } b a ;",
                "3 7 p drop drop",
                "\\ nothing",
                "q q + drop",
            ]),
            1..24,
        )
    ) {
        let mut lb = lbforth();
        let mut last = lb.forth.here().offset();
        prop_assert!(last > 0);
        for src in scripts {
            // Scripts that mention `q` or `p` before a definition ran
            // simply fail; the cursor must not move backwards either way.
            let _ = lb.forth.exec(src);
            let here = lb.forth.here().offset();
            prop_assert!(here >= last);
            prop_assert!((here as usize) <= Params::default().memory_bytes);
            last = here;
        }
    }

    #[test]
    fn locals_fully_unwound(
        pairs in proptest::collection::vec((any::<i16>(), any::<i16>()), 1..12)
    ) {
        let mut lb = lbforth();
        lb.forth.exec(": f { a b } a b + ;").unwrap();
        for (a, b) in pairs {
            lb.forth.exec(&format!("{a} {b} f drop")).unwrap();
            prop_assert_eq!(lb.forth.locals_depth(), 0);
        }
        // A failing call unwinds too.
        prop_assert_eq!(lb.forth.exec("f"), Err(Error::StackUnderflow));
        prop_assert_eq!(lb.forth.locals_depth(), 0);
    }

    #[test]
    fn tick_addresses_stay_valid_across_allot(extra in 1usize..32) {
        let mut lb = lbforth();
        lb.forth.exec(": w 1 ; ' w").unwrap();
        let addr = stack_of(&lb)[0];
        prop_assert!(addr >= 0);
        prop_assert!(addr <= lb.forth.here().offset());

        for i in 0..extra {
            lb.forth.exec(&format!("{i} ,")).unwrap();
            prop_assert!(addr <= lb.forth.here().offset());
        }
    }

    #[test]
    fn failing_exec_leaves_interpret_mode(
        n in any::<i16>(),
        junk in "[a-z]{1,12}",
    ) {
        let mut lb = lbforth();
        // `junk` is overwhelmingly unlikely to name a builtin; skip the
        // rare collision instead of special-casing it.
        prop_assume!(lb.forth.exec(&junk).is_err());

        let _ = lb.forth.exec(&format!(": broken {junk} ;"));
        prop_assert_eq!(
            lb.forth.shared_get(Shared::Compiling as usize).unwrap(),
            0
        );
        lb.forth.exec(&n.to_string()).unwrap();
        prop_assert_eq!(lb.forth.data_stack.iter().last(), Some(n as Cell));
    }
}
