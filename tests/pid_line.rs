use pipeworks::cmd::{read_pid_line, PidLineError, PidParser, TabPidParser, MAX_PID_LINE_LENGTH};
use proptest::prelude::*;
use tokio::io::BufReader;

fn first_line(input: Vec<u8>) -> Result<Option<String>, PidLineError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async move {
        let mut reader = BufReader::with_capacity(64, &input[..]);
        read_pid_line(&mut reader).await
    })
}

proptest! {
    #[test]
    fn accepts_lines_below_the_limit(len in 1usize..MAX_PID_LINE_LENGTH) {
        let mut input = vec![b'7'; len];
        input.extend_from_slice(b"\nrest\n");
        let line = first_line(input).unwrap().unwrap();
        prop_assert_eq!(line.len(), len);
    }

    #[test]
    fn rejects_lines_at_or_over_the_limit(extra in 0usize..2048, newline in any::<bool>()) {
        let mut input = vec![b'7'; MAX_PID_LINE_LENGTH + extra];
        if newline {
            input.push(b'\n');
        }
        let is_too_long = matches!(first_line(input), Err(PidLineError::TooLong { .. }));
        prop_assert!(is_too_long);
    }

    #[test]
    fn tab_parser_takes_the_second_field(pid in 1u32..4_000_000, child in 1u32..4_000_000) {
        let line = format!("PID\t{pid}\t{child}");
        prop_assert_eq!(TabPidParser.parse(&line), Some(pid.to_string()));
    }
}

#[test]
fn closed_stream_has_no_line() {
    assert!(first_line(Vec::new()).unwrap().is_none());
    assert!(first_line(b"\n \n".to_vec()).unwrap().is_none());
}
