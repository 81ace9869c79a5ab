//! Vectorized evaluation of parsed expressions against a dataset.

use std::cmp::Ordering;

use crate::dataset::{CellValue, ColumnType, Dataset};
use crate::settings::Settings;

use super::expr::{BinaryOp, Expr, UnaryOp};
use super::{RuntimeError, RuntimeResult};

/// A column-shaped value. Scalars are vectors of length one.
#[derive(Debug, Clone, PartialEq)]
pub enum Vector {
    Numbers(Vec<Option<f64>>),
    Logicals(Vec<Option<bool>>),
    Texts(Vec<Option<String>>),
}

impl Vector {
    pub fn len(&self) -> usize {
        match self {
            Self::Numbers(v) => v.len(),
            Self::Logicals(v) => v.len(),
            Self::Texts(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn numbers(&self, context: &str) -> RuntimeResult<Vec<Option<f64>>> {
        match self {
            Self::Numbers(v) => Ok(v.clone()),
            Self::Logicals(v) => Ok(v.iter().map(|b| b.map(|b| if b { 1.0 } else { 0.0 })).collect()),
            Self::Texts(_) => Err(RuntimeError::Evaluation(format!(
                "non-numeric argument to {}",
                context
            ))),
        }
    }

    fn logicals(&self, context: &str) -> RuntimeResult<Vec<Option<bool>>> {
        match self {
            Self::Logicals(v) => Ok(v.clone()),
            Self::Numbers(v) => Ok(v.iter().map(|n| n.map(|n| n != 0.0)).collect()),
            Self::Texts(_) => Err(RuntimeError::Evaluation(format!(
                "invalid argument type to {}",
                context
            ))),
        }
    }

    fn texts(&self) -> Vec<Option<String>> {
        match self {
            Self::Texts(v) => v.clone(),
            Self::Numbers(v) => v
                .iter()
                .map(|n| n.and_then(|n| CellValue::Number(n).label()))
                .collect(),
            Self::Logicals(v) => v
                .iter()
                .map(|b| b.map(|b| if b { "TRUE" } else { "FALSE" }.to_string()))
                .collect(),
        }
    }

    /// Interpret as a row filter of `rows` entries. Missing counts as excluded.
    pub fn into_filter(self, rows: usize) -> RuntimeResult<Vec<bool>> {
        let Self::Logicals(values) = self else {
            return Err(RuntimeError::Evaluation(
                "filter did not return a logical vector".to_string(),
            ));
        };
        let values = recycle(values, rows)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(false)).collect())
    }

    /// Interpret as the values of a column with `rows` entries.
    pub fn into_cells(self, rows: usize) -> RuntimeResult<Vec<CellValue>> {
        let cells: Vec<CellValue> = match self {
            Self::Numbers(v) => v
                .into_iter()
                .map(|n| n.map_or(CellValue::Missing, CellValue::Number))
                .collect(),
            Self::Logicals(v) => v
                .into_iter()
                .map(|b| b.map_or(CellValue::Missing, |b| CellValue::Number(f64::from(u8::from(b)))))
                .collect(),
            Self::Texts(v) => v
                .into_iter()
                .map(|s| s.map_or(CellValue::Missing, CellValue::Text))
                .collect(),
        };
        recycle(cells, rows)
    }

    /// Render for printing, e.g. `[1] 1.5 NA 3`.
    pub fn render(&self, settings: &Settings) -> String {
        let items: Vec<String> = match self {
            Self::Numbers(v) => v
                .iter()
                .map(|n| n.map_or("NA".to_string(), |n| settings.format_number(n)))
                .collect(),
            Self::Logicals(v) => v
                .iter()
                .map(|b| match b {
                    Some(true) => "TRUE".to_string(),
                    Some(false) => "FALSE".to_string(),
                    None => "NA".to_string(),
                })
                .collect(),
            Self::Texts(v) => v
                .iter()
                .map(|s| s.as_ref().map_or("NA".to_string(), |s| format!("\"{}\"", s)))
                .collect(),
        };
        if items.is_empty() {
            return "character(0)".to_string();
        }
        format!("[1] {}", items.join(" "))
    }
}

fn recycle<T: Clone>(values: Vec<T>, rows: usize) -> RuntimeResult<Vec<T>> {
    match values.len() {
        n if n == rows => Ok(values),
        1 => Ok(vec![values[0].clone(); rows]),
        n => Err(RuntimeError::Evaluation(format!(
            "result has {} values but the data has {} rows",
            n, rows
        ))),
    }
}

/// Length of the result of combining vectors of length `a` and `b`.
fn common_len(a: usize, b: usize) -> RuntimeResult<usize> {
    match (a, b) {
        (0, _) | (_, 0) => Ok(0),
        (a, b) if a == b => Ok(a),
        (1, b) => Ok(b),
        (a, 1) => Ok(a),
        (a, b) => Err(RuntimeError::Evaluation(format!(
            "vector lengths differ ({} and {})",
            a, b
        ))),
    }
}

fn at<T: Clone>(values: &[T], i: usize) -> T {
    if values.len() == 1 {
        values[0].clone()
    } else {
        values[i].clone()
    }
}

fn zip_with<A: Clone, B: Clone, R>(
    a: &[A],
    b: &[B],
    f: impl Fn(A, B) -> R,
) -> RuntimeResult<Vec<R>> {
    let len = common_len(a.len(), b.len())?;
    Ok((0..len).map(|i| f(at(a, i), at(b, i))).collect())
}

/// Evaluates expressions over the columns of one dataset.
pub struct Evaluator<'a> {
    dataset: Option<&'a Dataset>,
    whitelisted: bool,
    /// `set_option(name, value)` calls made during evaluation.
    pub option_writes: Vec<(String, String)>,
}

impl<'a> Evaluator<'a> {
    /// Evaluator resolving identifiers against `dataset`.
    pub fn new(dataset: Option<&'a Dataset>, whitelisted: bool) -> Self {
        Self {
            dataset,
            whitelisted,
            option_writes: Vec::new(),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> RuntimeResult<Vector> {
        match expr {
            Expr::Number(n) => Ok(Vector::Numbers(vec![Some(*n)])),
            Expr::Text(s) => Ok(Vector::Texts(vec![Some(s.clone())])),
            Expr::Logical(b) => Ok(Vector::Logicals(vec![Some(*b)])),
            Expr::Missing => Ok(Vector::Logicals(vec![None])),
            Expr::Identifier(name) => self.column(name),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => Ok(Vector::Numbers(
                        value
                            .numbers("unary operator")?
                            .into_iter()
                            .map(|n| n.map(|n| -n))
                            .collect(),
                    )),
                    UnaryOp::Not => Ok(Vector::Logicals(
                        value
                            .logicals("'!'")?
                            .into_iter()
                            .map(|b| b.map(|b| !b))
                            .collect(),
                    )),
                }
            }
            Expr::Binary { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(&left, *op, &right)
            }
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn column(&self, name: &str) -> RuntimeResult<Vector> {
        let column = self
            .dataset
            .and_then(|d| d.column_by_encoded(name).or_else(|| d.column(name)))
            .ok_or_else(|| RuntimeError::Evaluation(format!("object '{}' not found", name)))?;

        let numeric = match column.column_type {
            ColumnType::Scale => true,
            ColumnType::Nominal | ColumnType::Ordinal => false,
            ColumnType::Unknown => column
                .values
                .iter()
                .all(|v| v.is_missing() || v.as_number().is_some()),
        };

        Ok(if numeric {
            Vector::Numbers(column.numbers())
        } else {
            Vector::Texts(column.values.iter().map(CellValue::label).collect())
        })
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> RuntimeResult<Vector> {
        if name == "set_option" {
            return self.set_option(args);
        }

        let values = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<RuntimeResult<Vec<_>>>()?;

        let arity = |expected: usize| {
            if values.len() == expected {
                Ok(())
            } else {
                Err(RuntimeError::Evaluation(format!(
                    "{}() takes {} argument(s), got {}",
                    name,
                    expected,
                    values.len()
                )))
            }
        };

        match name {
            "abs" | "sqrt" | "exp" => {
                arity(1)?;
                let f = match name {
                    "abs" => f64::abs,
                    "sqrt" => f64::sqrt,
                    _ => f64::exp,
                };
                Ok(map_numbers(&values[0], name, f)?)
            }
            "log" => match values.len() {
                1 => map_numbers(&values[0], name, f64::ln),
                2 => {
                    let x = values[0].numbers(name)?;
                    let base = values[1].numbers(name)?;
                    Ok(Vector::Numbers(zip_with(&x, &base, |x, b| {
                        Some(x?.log(b?)).filter(|v| !v.is_nan())
                    })?))
                }
                n => Err(RuntimeError::Evaluation(format!(
                    "log() takes 1 or 2 arguments, got {}",
                    n
                ))),
            },
            "round" => {
                let digits = match values.len() {
                    1 => 0,
                    2 => values[1]
                        .numbers(name)?
                        .first()
                        .copied()
                        .flatten()
                        .map_or(0, |d| d as i32),
                    n => {
                        return Err(RuntimeError::Evaluation(format!(
                            "round() takes 1 or 2 arguments, got {}",
                            n
                        )));
                    }
                };
                let factor = 10f64.powi(digits);
                map_numbers(&values[0], name, |x| (x * factor).round() / factor)
            }
            "mean" | "sd" | "sum" | "min" | "max" => {
                arity(1)?;
                let present: Vec<f64> = values[0].numbers(name)?.into_iter().flatten().collect();
                Ok(Vector::Numbers(vec![aggregate(name, &present)]))
            }
            "length" => {
                arity(1)?;
                Ok(Vector::Numbers(vec![Some(values[0].len() as f64)]))
            }
            "is.na" | "is_na" => {
                arity(1)?;
                let flags = match &values[0] {
                    Vector::Numbers(v) => v.iter().map(|n| Some(n.is_none())).collect(),
                    Vector::Logicals(v) => v.iter().map(|b| Some(b.is_none())).collect(),
                    Vector::Texts(v) => v.iter().map(|s| Some(s.is_none())).collect(),
                };
                Ok(Vector::Logicals(flags))
            }
            "ifelse" => {
                arity(3)?;
                ifelse(&values[0], &values[1], &values[2])
            }
            "c" => concat(values),
            _ => Err(RuntimeError::Evaluation(format!(
                "could not find function \"{}\"",
                name
            ))),
        }
    }

    fn set_option(&mut self, args: &[Expr]) -> RuntimeResult<Vector> {
        if !self.whitelisted {
            return Err(RuntimeError::NotWhitelisted("set_option".to_string()));
        }
        let [Expr::Text(key), value] = args else {
            return Err(RuntimeError::Evaluation(
                "set_option() takes a name and a value".to_string(),
            ));
        };
        let value = self.eval(value)?.texts().into_iter().next().flatten().unwrap_or_default();
        self.option_writes.push((key.clone(), value));
        Ok(Vector::Logicals(vec![Some(true)]))
    }
}

fn map_numbers(value: &Vector, name: &str, f: impl Fn(f64) -> f64) -> RuntimeResult<Vector> {
    Ok(Vector::Numbers(
        value
            .numbers(name)?
            .into_iter()
            .map(|n| n.map(&f).filter(|v| !v.is_nan()))
            .collect(),
    ))
}

/// Summary statistic over the non-missing values.
pub(crate) fn aggregate(name: &str, values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    match name {
        "sum" => Some(values.iter().sum()),
        "mean" if !values.is_empty() => Some(values.iter().sum::<f64>() / n),
        "sd" if values.len() > 1 => {
            let mean = values.iter().sum::<f64>() / n;
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            Some((ss / (n - 1.0)).sqrt())
        }
        "min" => values.iter().copied().reduce(f64::min),
        "max" => values.iter().copied().reduce(f64::max),
        _ => None,
    }
}

fn binary(left: &Vector, op: BinaryOp, right: &Vector) -> RuntimeResult<Vector> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow => {
            let a = left.numbers("binary operator")?;
            let b = right.numbers("binary operator")?;
            let f = |x: f64, y: f64| match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                _ => x.powf(y),
            };
            Ok(Vector::Numbers(zip_with(&a, &b, |x, y| {
                Some(f(x?, y?)).filter(|v| !v.is_nan())
            })?))
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let accept = |ordering: Ordering| match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::Ne => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            let flags = if matches!(left, Vector::Texts(_)) || matches!(right, Vector::Texts(_)) {
                zip_with(&left.texts(), &right.texts(), |x, y| {
                    Some(accept(x?.cmp(&y?)))
                })?
            } else {
                let a = left.numbers("comparison")?;
                let b = right.numbers("comparison")?;
                zip_with(&a, &b, |x, y| x?.partial_cmp(&y?).map(accept))?
            };
            Ok(Vector::Logicals(flags))
        }
        BinaryOp::And => {
            let a = left.logicals("'&'")?;
            let b = right.logicals("'&'")?;
            Ok(Vector::Logicals(zip_with(&a, &b, |x, y| match (x, y) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            })?))
        }
        BinaryOp::Or => {
            let a = left.logicals("'|'")?;
            let b = right.logicals("'|'")?;
            Ok(Vector::Logicals(zip_with(&a, &b, |x, y| match (x, y) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            })?))
        }
    }
}

fn ifelse(condition: &Vector, yes: &Vector, no: &Vector) -> RuntimeResult<Vector> {
    let condition = condition.logicals("ifelse()")?;
    let len = common_len(condition.len(), common_len(yes.len(), no.len())?)?;

    let pick = |i: usize| at(&condition, i);
    let textual = matches!(yes, Vector::Texts(_)) || matches!(no, Vector::Texts(_));

    if textual {
        let (yes, no) = (yes.texts(), no.texts());
        Ok(Vector::Texts(
            (0..len)
                .map(|i| pick(i).and_then(|c| if c { at(&yes, i) } else { at(&no, i) }))
                .collect(),
        ))
    } else {
        let (yes, no) = (yes.numbers("ifelse()")?, no.numbers("ifelse()")?);
        Ok(Vector::Numbers(
            (0..len)
                .map(|i| pick(i).and_then(|c| if c { at(&yes, i) } else { at(&no, i) }))
                .collect(),
        ))
    }
}

fn concat(values: Vec<Vector>) -> RuntimeResult<Vector> {
    if values.iter().any(|v| matches!(v, Vector::Texts(_))) {
        return Ok(Vector::Texts(values.iter().flat_map(Vector::texts).collect()));
    }
    if values.iter().all(|v| matches!(v, Vector::Logicals(_))) && !values.is_empty() {
        let mut out = Vec::new();
        for value in &values {
            out.extend(value.logicals("c()")?);
        }
        return Ok(Vector::Logicals(out));
    }
    let mut out = Vec::new();
    for value in &values {
        out.extend(value.numbers("c()")?);
    }
    Ok(Vector::Numbers(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;
    use crate::runtime::expr::parse;

    fn dataset() -> Dataset {
        let mut missing = Column::scale("y", &[1.0, 0.0, 5.0]);
        missing.values[1] = CellValue::Missing;
        Dataset::from_columns(vec![
            Column::scale("x", &[-1.0, 2.0, 3.0]),
            missing,
            Column::nominal("g", &["a", "b", "a"]),
        ])
        .unwrap()
    }

    fn eval(code: &str) -> RuntimeResult<Vector> {
        let data = dataset();
        let encoded = data.encoder().encode_all(code);
        let expr = parse(&encoded)?;
        Evaluator::new(Some(&data), false).eval(&expr)
    }

    #[test]
    fn test_filter_comparison() {
        let result = eval("x > 0").unwrap().into_filter(3).unwrap();
        assert_eq!(result, vec![false, true, true]);
    }

    #[test]
    fn test_missing_propagates() {
        assert_eq!(
            eval("y * 2").unwrap(),
            Vector::Numbers(vec![Some(2.0), None, Some(10.0)])
        );
        // NA in a filter excludes the row
        assert_eq!(eval("y > 0").unwrap().into_filter(3).unwrap(), vec![true, false, true]);
        assert_eq!(
            eval("y > 0 & x > 0").unwrap(),
            Vector::Logicals(vec![Some(false), None, Some(true)])
        );
    }

    #[test]
    fn test_text_comparison() {
        assert_eq!(
            eval("g == \"a\"").unwrap().into_filter(3).unwrap(),
            vec![true, false, true]
        );
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("mean(x)").unwrap(), Vector::Numbers(vec![Some(4.0 / 3.0)]));
        assert_eq!(eval("sum(y)").unwrap(), Vector::Numbers(vec![Some(6.0)]));
        assert_eq!(eval("length(x)").unwrap(), Vector::Numbers(vec![Some(3.0)]));
        assert_eq!(
            eval("is.na(y)").unwrap(),
            Vector::Logicals(vec![Some(false), Some(true), Some(false)])
        );
        assert_eq!(
            eval("ifelse(x > 0, \"pos\", \"neg\")").unwrap(),
            Vector::Texts(vec![
                Some("neg".to_string()),
                Some("pos".to_string()),
                Some("pos".to_string())
            ])
        );
        assert_eq!(eval("round(2.567, 1)").unwrap(), Vector::Numbers(vec![Some(2.6)]));
        assert_eq!(eval("abs(x)").unwrap(), Vector::Numbers(vec![Some(1.0), Some(2.0), Some(3.0)]));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(eval("nope > 1"), Err(RuntimeError::Evaluation(_))));
        assert!(matches!(eval("g + 1"), Err(RuntimeError::Evaluation(_))));
        assert!(matches!(eval("frobnicate(x)"), Err(RuntimeError::Evaluation(_))));
        assert!(matches!(eval("c(1, 2) + x"), Err(RuntimeError::Evaluation(_))));
        assert!(matches!(
            eval("set_option('a', 1)"),
            Err(RuntimeError::NotWhitelisted(_))
        ));
    }

    #[test]
    fn test_set_option_when_whitelisted() {
        let expr = parse("set_option('ppi', 144)").unwrap();
        let mut evaluator = Evaluator::new(None, true);
        evaluator.eval(&expr).unwrap();
        assert_eq!(evaluator.option_writes, vec![("ppi".to_string(), "144".to_string())]);
    }

    #[test]
    fn test_into_cells_recycles_scalars() {
        let cells = Vector::Numbers(vec![Some(1.0)]).into_cells(3).unwrap();
        assert_eq!(cells, vec![CellValue::Number(1.0); 3]);
        assert!(Vector::Numbers(vec![Some(1.0), Some(2.0)]).into_cells(3).is_err());
        assert!(Vector::Numbers(vec![Some(1.0)]).into_filter(3).is_err());
    }

    #[test]
    fn test_render() {
        let settings = Settings::default();
        assert_eq!(
            Vector::Logicals(vec![Some(true), None]).render(&settings),
            "[1] TRUE NA"
        );
        assert_eq!(Vector::Texts(vec![Some("a".to_string())]).render(&settings), "[1] \"a\"");
    }
}
