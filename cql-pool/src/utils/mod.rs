pub(crate) mod futures;

#[cfg(test)]
pub(crate) mod test_utils;
