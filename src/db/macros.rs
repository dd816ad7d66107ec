/// Append `column = ?N` and its bound value for a partial UPDATE.
///
/// `$value` is an `Option<T>` with `T: ToSql + 'static`; `None` leaves the
/// column untouched. The placeholder index follows the number of values
/// already bound, so the WHERE parameter goes last:
///
/// ```ignore
/// let mut sets = vec!["updated_at = ?1".to_string()];
/// let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(now)];
/// push_field!(sets, values, "priority", input.priority);
/// values.push(Box::new(id.to_string()));
/// let sql = format!("UPDATE t SET {} WHERE id = ?{}", sets.join(", "), values.len());
/// ```
#[macro_export]
macro_rules! push_field {
    ($sets:expr, $values:expr, $col:literal, $value:expr) => {
        if let Some(v) = $value {
            $values.push(Box::new(v) as Box<dyn rusqlite::types::ToSql>);
            $sets.push(format!("{} = ?{}", $col, $values.len()));
        }
    };
}
