use std::any::Any;

/// Turn a caught panic payload into a readable error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow::anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow::anyhow!("job panicked: {message}")
    } else {
        anyhow::anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: boom"
        );

        let payload: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: boom"
        );

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked");
    }
}
