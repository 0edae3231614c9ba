#![no_main]
use libfuzzer_sys::fuzz_target;
use seccomp_diff::bpf::{Instruction, Program};
use seccomp_diff::exec::{instrumented_exec, SeccompData};

// Any program the validator accepts must run to a return without panicking.
fuzz_target!(|input: (Vec<Instruction>, SeccompData)| {
    let (instructions, data) = input;
    let Ok(program) = Program::new(instructions) else {
        return;
    };
    let execution = instrumented_exec(&program, &data);
    assert!(execution.coverage.is_covered(0));
    assert_eq!(execution.coverage.len(), program.len());
});
