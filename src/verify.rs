// This module implements the restricted-subset verifier. It walks the body of a bound
// KernelSpec and every helper it defines, and checks each statement and expression against
// the execution model of a tile: no heap allocation, no call that cannot be resolved to one
// statically known function, no call into a native library or the host runtime, and no
// reference to host data that was not captured as a constant. The walk never stops at the
// first problem; every violation is recorded with a location path so a single run reports
// everything that needs fixing. The verifier only inspects, it never rewrites the spec.

//! Restricted-subset verifier.

use crate::core::error::{Rule, VerificationError, Violation};
use crate::kernel::display::ExprText;
use crate::kernel::visit::visit_expr;
use crate::kernel::{ArrayRef, Callee, Capture, Expr, KernelSpec, Macro, Stmt};

/// Root of location paths inside the kernel body.
pub const BODY_ROOT: &str = "compute";

/// Check that `spec` stays inside the device-compilable subset.
///
/// Library calls must already have been bound by
/// [`crate::intrinsics::bind`]; whatever is left unbound is a foreign call.
pub fn verify(spec: &KernelSpec) -> Result<(), VerificationError> {
    let mut verifier = Verifier {
        spec,
        violations: Vec::new(),
    };

    verifier.stmts(spec.body(), BODY_ROOT);
    for helper in spec.helpers() {
        verifier.stmts(&helper.body, &format!("helper {}", helper.name));
    }

    if verifier.violations.is_empty() {
        log::debug!("codelet `{}` verified", spec.name());
        return Ok(());
    }

    log::debug!(
        "codelet `{}` rejected with {} violation(s)",
        spec.name(),
        verifier.violations.len()
    );
    Err(VerificationError {
        codelet: spec.name().to_string(),
        violations: verifier.violations,
    })
}

struct Verifier<'s> {
    spec: &'s KernelSpec,
    violations: Vec<Violation>,
}

impl Verifier<'_> {
    fn report(&mut self, rule: Rule, location: &str, detail: String) {
        log::trace!("{} at {}: {}", rule, location, detail);
        self.violations.push(Violation {
            rule,
            location: location.to_string(),
            detail,
        });
    }

    fn stmts(&mut self, stmts: &[Stmt], path: &str) {
        for (i, stmt) in stmts.iter().enumerate() {
            let location = format!("{}/{}", path, i);
            self.stmt(stmt, &location);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, location: &str) {
        match stmt {
            Stmt::Let { value, .. } | Stmt::Assign { value, .. } => self.expr(value, location),
            Stmt::Store { field, index, value } => {
                self.store_target(field, location);
                if let Some(index) = index {
                    self.expr(index, location);
                }
                self.expr(value, location);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond, location);
                self.stmts(then, &format!("{}/then", location));
                self.stmts(otherwise, &format!("{}/else", location));
            }
            Stmt::For {
                start, end, body, ..
            } => {
                self.expr(start, location);
                self.expr(end, location);
                self.stmts(body, &format!("{}/body", location));
            }
            Stmt::While { cond, body } => {
                self.expr(cond, location);
                self.stmts(body, &format!("{}/body", location));
            }
            Stmt::Block(body) => self.stmts(body, &format!("{}/block", location)),
            Stmt::Expr(expr) => self.expr(expr, location),
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.expr(value, location);
                }
            }
            Stmt::Macro(Macro::Print { args, .. }) => {
                for arg in args {
                    self.expr(arg, location);
                }
            }
            Stmt::Macro(Macro::Show { expr, .. }) => self.expr(expr, location),
            Stmt::Macro(Macro::Cycles { body, .. }) => self.stmts(body, &format!("{}/cycles", location)),
        }
    }

    fn store_target(&mut self, name: &str, location: &str) {
        if self.spec.field(name).is_some() {
            return;
        }
        match self.spec.captures().get(name) {
            Some(Capture::Mutable { .. }) => self.report(
                Rule::ExternalReference,
                location,
                format!("writes mutable host variable `{}`", name),
            ),
            Some(_) => self.report(Rule::Malformed, location, format!("assigns to constant `{}`", name)),
            None => self.report(
                Rule::ExternalReference,
                location,
                format!("writes `{}`, which is neither a field nor captured", name),
            ),
        }
    }

    fn expr(&mut self, expr: &Expr, location: &str) {
        let mut found: Vec<(Rule, String)> = Vec::new();
        visit_expr(expr, &mut |e| {
            if let Some(violation) = check_expr(self.spec, e) {
                found.push(violation);
            }
        });
        for (rule, detail) in found {
            self.report(rule, location, detail);
        }
    }
}

fn check_expr(spec: &KernelSpec, expr: &Expr) -> Option<(Rule, String)> {
    match expr {
        Expr::Alloc { elem, len } => Some((
            Rule::HeapAllocation,
            format!("allocates [{}; {}] on the heap", elem, ExprText(len)),
        )),
        Expr::Global(name)
        | Expr::Index {
            base: ArrayRef::Global(name),
            ..
        } => global_reference(spec, name),
        Expr::Field(name)
        | Expr::Len(name)
        | Expr::Index {
            base: ArrayRef::Field(name),
            ..
        } => match spec.field(name) {
            Some(_) => None,
            None => Some((Rule::Malformed, format!("`{}` is not a field of `{}`", name, spec.name()))),
        },
        Expr::Call(call) => match &call.callee {
            Callee::Static(name) => match spec.helper(name) {
                Some(_) => None,
                None => Some((
                    Rule::DynamicDispatch,
                    format!("`{}` does not resolve to a helper function", name),
                )),
            },
            Callee::Intrinsic(_) => None,
            Callee::Dynamic { method } => Some((
                Rule::DynamicDispatch,
                format!("`.{}()` dispatches on the runtime type of its receiver", method),
            )),
            Callee::Library(name) => {
                let shape = match call.type_arg {
                    Some(ty) => format!("{}({})", name, ty),
                    None => format!("{}/{}", name, call.args.len()),
                };
                Some((Rule::ForeignCall, format!("`{}` has no device binding", shape)))
            }
            Callee::Foreign { library, symbol } => Some((
                Rule::ForeignCall,
                format!("calls `{}` from native library `{}`", symbol, library),
            )),
            Callee::Runtime(name) => Some((Rule::ForeignCall, format!("calls host runtime routine `{}`", name))),
        },
        _ => None,
    }
}

fn global_reference(spec: &KernelSpec, name: &str) -> Option<(Rule, String)> {
    match spec.captures().get(name) {
        Some(Capture::Constant(_)) | Some(Capture::ConstArray { .. }) => None,
        Some(Capture::Mutable { .. }) => Some((
            Rule::ExternalReference,
            format!("reads mutable host variable `{}`", name),
        )),
        None => Some((
            Rule::ExternalReference,
            format!("`{}` is not captured as a constant", name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ElemType, HelperFn, Param, Scalar};

    #[test]
    fn accepts_plain_kernel() {
        let spec = KernelSpec::builder("Copy")
            .input("x", ElemType::F32)
            .output("y", ElemType::F32)
            .constant("K", Scalar::F32(2.0))
            .body(vec![Stmt::for_range(
                "i",
                Expr::int(0),
                Expr::len("x"),
                vec![Stmt::store(
                    "y",
                    Expr::local("i"),
                    Expr::index("x", Expr::local("i")) * Expr::global("K"),
                )],
            )])
            .build()
            .unwrap();
        assert!(verify(&spec).is_ok());
    }

    #[test]
    fn reports_every_violation_with_location() {
        let spec = KernelSpec::builder("Bad")
            .output("y", ElemType::F32)
            .mutable_global("G", ElemType::F32)
            .helper(HelperFn::new(
                "h",
                vec![Param::generic("v")],
                vec![Stmt::Return(Some(Expr::library("sinh", vec![Expr::local("v")])))],
            ))
            .body(vec![
                Stmt::let_("buf", Expr::alloc(ElemType::F32, Expr::int(16))),
                Stmt::if_(
                    Expr::bool(true),
                    vec![Stmt::store("y", Expr::int(0), Expr::global("G"))],
                    vec![],
                ),
            ])
            .build()
            .unwrap();

        let err = verify(&spec).unwrap_err();
        assert_eq!(err.rule(), Rule::HeapAllocation);
        let located: Vec<(Rule, &str)> = err
            .violations()
            .iter()
            .map(|v| (v.rule, v.location.as_str()))
            .collect();
        assert_eq!(
            located,
            [
                (Rule::HeapAllocation, "compute/0"),
                (Rule::ExternalReference, "compute/1/then/0"),
                (Rule::ForeignCall, "helper h/0"),
            ]
        );
    }

    #[test]
    fn missing_helper_is_dynamic_dispatch() {
        let spec = KernelSpec::builder("K")
            .output("y", ElemType::U32)
            .body(vec![Stmt::Expr(Expr::helper("nowhere", vec![]))])
            .build()
            .unwrap();
        assert_eq!(verify(&spec).unwrap_err().rule(), Rule::DynamicDispatch);
    }

    #[test]
    fn writes_to_constants_and_host_variables() {
        let spec = KernelSpec::builder("K")
            .constant("C", Scalar::U32(1))
            .mutable_global("M", ElemType::U32)
            .body(vec![
                Stmt::store_scalar("C", Expr::int(2)),
                Stmt::store_scalar("M", Expr::int(2)),
            ])
            .build()
            .unwrap();
        let err = verify(&spec).unwrap_err();
        assert_eq!(err.rule(), Rule::Malformed);
        assert!(err.has_rule(Rule::ExternalReference));
    }
}
