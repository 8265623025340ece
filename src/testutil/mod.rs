//! # Test Utilities
//!
//! Runs scripted exchanges against an engine: feed one line of source,
//! check what came of it, repeat.
//!
//! ## Script format
//!
//! Each line of a script is one of these directives:
//!
//! * `> INPUT` — exec the rest of the line; it must succeed.
//! * `< TEXT` — one expected output line for the preceding `>`. Repeat
//!   for multi-line output. A `>` with no `<` lines accepts any output.
//! * `x INPUT` — exec must fail, with any error.
//! * `e ERROR INPUT` — exec must fail with exactly this error, named by
//!   its `Debug` form (e.g. `WordNotFound`).
//! * `cfg KEY VALUE` — override one [`Params`] field of the engine under
//!   test. Only before the first step, and only in [`runtest`] (which
//!   builds the engine itself).
//! * Anything else is prose and is skipped.
//!
//! ### Example
//!
//! ```rust
//! # use forthright::testutil::runtest;
//! #
//! # runtest(r#"
//! cfg data_stack_elems 8
//! > : star 42 emit ;
//! > star
//! < *
//! e WordNotFound starb
//! # "#)
//! ```

use crate::{
    leakbox::{LBForth, Params},
    Forth,
};

/// One scripted exchange: a line of input and what must come of it.
struct Step {
    input: String,
    /// `None` expects success; `Some("")` any error; otherwise the error
    /// whose `Debug` name matches.
    want_err: Option<String>,
    want_out: Vec<String>,
}

struct Script {
    params: Params,
    steps: Vec<Step>,
}

/// Run a test script against a fresh engine, honoring `cfg` overrides.
pub fn runtest(contents: &str) {
    let script = parse(contents, true);
    let mut lb = LBForth::from_params(script.params, ());
    for step in &script.steps {
        run_step(&mut lb.forth, step);
    }
}

/// Run a test script against an existing engine. The engine is already
/// built, so `cfg` lines are rejected.
pub fn runtest_with<T>(forth: &mut Forth<T>, contents: &str) {
    let script = parse(contents, false);
    for step in &script.steps {
        run_step(forth, step);
    }
}

fn run_step<T>(forth: &mut Forth<T>, step: &Step) {
    let res = forth.exec(&step.input);
    let output = forth.output.as_str().to_string();
    forth.output.clear();

    match res {
        Ok(()) => {
            if let Some(want) = &step.want_err {
                panic!(
                    "`{}` succeeded, wanted an error {want:?}; output: {output:?}",
                    step.input
                );
            }
            if step.want_out.is_empty() {
                return;
            }
            let got: Vec<&str> = output.lines().map(str::trim_end).collect();
            let want: Vec<&str> = step.want_out.iter().map(|l| l.trim_end()).collect();
            if got != want {
                panic!("`{}` printed {got:?}, wanted {want:?}", step.input);
            }
        }
        Err(err) => match &step.want_err {
            Some(want) if want.is_empty() || *want == format!("{err:?}") => {}
            Some(want) => panic!("`{}` failed with {err:?}, wanted {want}", step.input),
            None => panic!(
                "`{}` failed with {err:?} ({})",
                step.input,
                forth.error_message()
            ),
        },
    }
}

fn parse(contents: &str, allow_cfg: bool) -> Script {
    let mut script = Script {
        params: Params::default(),
        steps: Vec::new(),
    };

    for line in contents.lines() {
        let (tag, rest) = match line.trim().split_once(char::is_whitespace) {
            Some(split) => split,
            None => continue,
        };
        match tag {
            ">" => script.steps.push(Step {
                input: rest.to_string(),
                want_err: None,
                want_out: Vec::new(),
            }),
            "x" => script.steps.push(Step {
                input: rest.to_string(),
                want_err: Some(String::new()),
                want_out: Vec::new(),
            }),
            "e" => {
                let (name, input) = rest
                    .split_once(char::is_whitespace)
                    .expect("`e` needs an error name and an input");
                script.steps.push(Step {
                    input: input.to_string(),
                    want_err: Some(name.to_string()),
                    want_out: Vec::new(),
                });
            }
            "<" => {
                let step = script
                    .steps
                    .last_mut()
                    .expect("`<` must follow an input line");
                assert!(step.want_err.is_none(), "failing steps print nothing");
                step.want_out.push(rest.to_string());
            }
            "cfg" => {
                assert!(allow_cfg, "cfg needs a fresh engine; use runtest");
                assert!(script.steps.is_empty(), "cfg must precede all steps");
                let (key, value) = rest
                    .split_once(char::is_whitespace)
                    .expect("cfg takes KEY VALUE");
                let value = value.trim().parse().expect("cfg value must be a number");
                set_param(&mut script.params, key, value);
            }
            _ => {}
        }
    }

    script
}

fn set_param(params: &mut Params, key: &str, value: usize) {
    match key {
        "data_stack_elems" => params.data_stack_elems = value,
        "locals_stack_elems" => params.locals_stack_elems = value,
        "cword_table_elems" => params.cword_table_elems = value,
        "memory_bytes" => params.memory_bytes = value,
        "shared_elems" => params.shared_elems = value,
        "output_buf_bytes" => params.output_buf_bytes = value,
        _ => panic!("unknown cfg key {key}"),
    }
}
